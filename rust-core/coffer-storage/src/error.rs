// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Engine failures. Layers above wrap these transparently, so callers of
// `Database::open` or request teardown see the engine's own error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine cannot be reached or opened.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The engine was reached but an operation on it failed.
    #[error("{operation} failed: {message}")]
    Engine {
        operation: &'static str,
        message: String,
    },
}

impl StorageError {
    #[cfg(any(feature = "redb-backend", test))]
    pub(crate) fn engine(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Engine {
            operation,
            message: err.to_string(),
        }
    }

    /// True when no operation could reach the engine at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_) | Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailability() {
        let io = StorageError::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(io.is_unavailable());
        assert!(StorageError::BackendUnavailable("refused".into()).is_unavailable());

        let engine = StorageError::engine("commit", "disk full");
        assert!(!engine.is_unavailable());
        assert_eq!(engine.to_string(), "commit failed: disk full");
    }
}
