// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Error types for the object database layer.

use coffer_storage::StorageError;
use coffer_txn::TransactionError;
use thiserror::Error;

use crate::connection::ConnectionId;

/// Errors raised while configuring a database or using a connection.
#[derive(Debug, Error)]
pub enum DbError {
    /// Storage configuration is missing or cannot be understood.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The connection was already returned to its pool.
    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    /// A root value could not be converted to or from JSON.
    #[error("value for key '{key}' could not be serialized: {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

impl DbError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

pub type DbResult<T> = Result<T, DbError>;
