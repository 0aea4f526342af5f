// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Process-local engine behind `memory://` URIs.
//
// An ordered map under a tokio RwLock. A batch holds the write guard for
// its whole length, so readers never observe half a commit.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::trace;

use crate::backend::{BatchOp, StorageBackend};
use crate::error::StorageError;

#[derive(Debug, Default)]
struct Shared {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    batches: AtomicU64,
}

/// Volatile engine. Clones are handles to the same data.
///
/// ```rust
/// use coffer_storage::{BatchOp, InMemoryBackend, StorageBackend};
///
/// # tokio_test::block_on(async {
/// let engine = InMemoryBackend::new();
/// engine.apply_batch(&[BatchOp::put("root:answer", "42")]).await.unwrap();
/// assert_eq!(engine.get(b"root:answer").await.unwrap(), Some(b"42".to_vec()));
/// assert_eq!(engine.batches_applied(), 1);
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    shared: Arc<Shared>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.shared.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Commit batches applied since creation.
    pub fn batches_applied(&self) -> u64 {
        self.shared.batches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.shared.entries.read().await.get(key).cloned())
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let entries = self.shared.entries.read().await;
        Ok(entries
            .range::<[u8], _>((std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn apply_batch(&self, ops: &[BatchOp]) -> Result<(), StorageError> {
        let mut entries = self.shared.entries.write().await;
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    entries.insert(key.clone(), value.clone());
                }
                BatchOp::Delete { key } => {
                    entries.remove(key);
                }
            }
        }
        let n = self.shared.batches.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(batch = n, ops = ops.len(), "In-memory batch applied");
        Ok(())
    }
}
