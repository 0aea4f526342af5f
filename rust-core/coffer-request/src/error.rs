// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Errors surfaced to request handlers and to the host.

use coffer_db::DbError;
use coffer_txn::TransactionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RequestError {
    /// The extension is already bound to this application.
    #[error("coffer is already initialized on application '{0}'")]
    DoubleInitialization(String),

    /// The application has no Coffer extension bound.
    #[error("coffer is not initialized on this application")]
    NotInitialized,

    /// The operation needs an open connection and none has been opened.
    #[error("request context has no open connection")]
    NotConnected,

    /// The request context was already torn down.
    #[error("request context is already torn down")]
    TornDown,

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// A failure reported by application code.
    #[error("{0}")]
    Application(String),
}

impl RequestError {
    pub fn application(msg: impl Into<String>) -> Self {
        Self::Application(msg.into())
    }

    /// True when a commit lost a write race with another request.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Transaction(e) | Self::Db(DbError::Transaction(e)) => e.is_conflict(),
            _ => false,
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Db(e) if e.is_configuration())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_detection_through_both_paths() {
        let conflict = || TransactionError::Conflict {
            key: "k".into(),
            expected: 1,
            actual: 2,
        };
        assert!(RequestError::from(conflict()).is_conflict());
        assert!(RequestError::from(DbError::from(conflict())).is_conflict());
        assert!(!RequestError::NotConnected.is_conflict());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            RequestError::DoubleInitialization("shop".into()).to_string(),
            "coffer is already initialized on application 'shop'"
        );
        assert_eq!(RequestError::application("boom").to_string(), "boom");
    }
}
