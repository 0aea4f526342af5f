// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The engine contract.
//
// A pool needs three things from an engine: point reads, ordered prefix
// scans, and one atomic write per committed transaction. Everything else
// (caching, conflict detection, namespacing) happens above this line.

use async_trait::async_trait;

use crate::error::StorageError;

/// A single write inside a commit batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl BatchOp {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self::Delete { key: key.into() }
    }

    pub fn key(&self) -> &[u8] {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }

    /// Value bytes written by this op; deletes write none.
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Put { value, .. } => value.len(),
            Self::Delete { .. } => 0,
        }
    }
}

/// Key-value engine shared by every connection of one pool.
///
/// Keys and values are opaque bytes.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short engine name for logs and pool statistics.
    fn name(&self) -> &str;

    /// Called before each connection lease. Engines that can lose their
    /// transport override this to report it.
    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// The committed value of `key`, or `None`.
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Every committed entry whose key starts with `prefix`, in key order.
    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;

    /// Apply `ops` in order as one atomic write. On error nothing is applied.
    async fn apply_batch(&self, ops: &[BatchOp]) -> Result<(), StorageError>;
}
