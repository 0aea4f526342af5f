// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! Errors raised while driving a transaction.

use coffer_storage::StorageError;
use thiserror::Error;

use crate::manager::{TransactionId, TransactionState};

/// Errors from the transaction manager and the resources it coordinates.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// The transaction is not in a state that allows the requested operation.
    #[error("transaction state is {current:?}, expected {expected}")]
    InvalidState {
        current: TransactionState,
        expected: &'static str,
    },

    /// Commit was requested on a transaction marked doomed.
    #[error("transaction {0} is doomed and cannot commit")]
    Doomed(TransactionId),

    /// A resource rejected the commit because another transaction changed
    /// the same key after this one read it. Not retried here.
    #[error("write conflict on {key}: read at serial {expected}, committed at serial {actual}")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// The storage engine failed while voting or finishing.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl TransactionError {
    /// True when the commit lost a write race and may succeed if retried.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_display() {
        let err = TransactionError::Conflict {
            key: "answer".to_string(),
            expected: 3,
            actual: 5,
        };
        assert!(err.is_conflict());
        assert_eq!(
            err.to_string(),
            "write conflict on answer: read at serial 3, committed at serial 5"
        );
    }

    #[test]
    fn test_storage_error_is_transparent() {
        let err: TransactionError =
            StorageError::BackendUnavailable("connection refused".to_string()).into();
        assert!(!err.is_conflict());
        assert_eq!(err.to_string(), "backend unavailable: connection refused");
    }

    #[test]
    fn test_invalid_state_display() {
        let err = TransactionError::InvalidState {
            current: TransactionState::Committed,
            expected: "Active",
        };
        assert!(err.to_string().contains("Committed"));
    }
}
