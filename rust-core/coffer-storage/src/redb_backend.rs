// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Single-file persistent engine behind `redb://` and `file://` URIs.
//
// redb is synchronous, so every call runs on the blocking pool. Reads use
// their own read transaction and never wait on writers. Each commit batch
// is one redb write transaction; dropping it uncommitted on error leaves
// the file as it was.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, TableDefinition, TableError};
use tracing::debug;

use crate::backend::{BatchOp, StorageBackend};
use crate::error::StorageError;

const OBJECTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("coffer_objects");

/// Persistent engine stored in one redb file.
///
/// ```rust,no_run
/// use coffer_storage::{BatchOp, RedbBackend, StorageBackend};
///
/// # tokio_test::block_on(async {
/// let engine = RedbBackend::open("/var/lib/coffer/main.redb").unwrap();
/// engine.apply_batch(&[BatchOp::put("root:answer", "42")]).await.unwrap();
/// # });
/// ```
#[derive(Clone)]
pub struct RedbBackend {
    db: Arc<Database>,
    path: PathBuf,
}

impl RedbBackend {
    /// Open the file at `path`, creating it and its parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let db = Database::create(&path).map_err(|e| {
            StorageError::BackendUnavailable(format!("cannot open {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "redb engine opened");
        Ok(Self {
            db: Arc::new(db),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the database on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StorageError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| StorageError::BackendUnavailable(format!("blocking task failed: {e}")))?
    }
}

/// Smallest key greater than every key that starts with `prefix`.
/// `None` when no such key exists (empty or all-0xFF prefix).
fn successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bound = prefix.to_vec();
    while let Some(last) = bound.pop() {
        if last < u8::MAX {
            bound.push(last + 1);
            return Some(bound);
        }
    }
    None
}

impl std::fmt::Debug for RedbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbBackend").field("path", &self.path).finish()
    }
}

#[async_trait]
impl StorageBackend for RedbBackend {
    fn name(&self) -> &str {
        "redb"
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.blocking(|db| {
            db.begin_read()
                .map(drop)
                .map_err(|e| StorageError::BackendUnavailable(e.to_string()))
        })
        .await
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let key = key.to_vec();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(|e| StorageError::engine("read", e))?;
            let table = match txn.open_table(OBJECTS) {
                Ok(table) => table,
                // Nothing has been committed yet.
                Err(TableError::TableDoesNotExist(_)) => return Ok(None),
                Err(e) => return Err(StorageError::engine("open table", e)),
            };
            let value = table
                .get(key.as_slice())
                .map_err(|e| StorageError::engine("get", e))?;
            Ok(value.map(|v| v.value().to_vec()))
        })
        .await
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let prefix = prefix.to_vec();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(|e| StorageError::engine("read", e))?;
            let table = match txn.open_table(OBJECTS) {
                Ok(table) => table,
                Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
                Err(e) => return Err(StorageError::engine("open table", e)),
            };
            let upper = successor(&prefix);
            let range = match &upper {
                Some(upper) => table.range(prefix.as_slice()..upper.as_slice()),
                None => table.range(prefix.as_slice()..),
            }
            .map_err(|e| StorageError::engine("scan", e))?;

            let entries = range
                .map(|entry| {
                    let (k, v) = entry.map_err(|e| StorageError::engine("scan", e))?;
                    Ok((k.value().to_vec(), v.value().to_vec()))
                })
                .collect::<Result<Vec<_>, StorageError>>();
            entries
        })
        .await
    }

    async fn apply_batch(&self, ops: &[BatchOp]) -> Result<(), StorageError> {
        let ops = ops.to_vec();
        self.blocking(move |db| {
            let txn = db
                .begin_write()
                .map_err(|e| StorageError::engine("begin write", e))?;
            {
                let mut table = txn
                    .open_table(OBJECTS)
                    .map_err(|e| StorageError::engine("open table", e))?;
                for op in &ops {
                    match op {
                        BatchOp::Put { key, value } => {
                            table
                                .insert(key.as_slice(), value.as_slice())
                                .map_err(|e| StorageError::engine("insert", e))?;
                        }
                        BatchOp::Delete { key } => {
                            table
                                .remove(key.as_slice())
                                .map_err(|e| StorageError::engine("remove", e))?;
                        }
                    }
                }
            }
            txn.commit().map_err(|e| StorageError::engine("commit", e))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine() -> (RedbBackend, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let engine = RedbBackend::open(dir.path().join("objects.redb")).unwrap();
        (engine, dir)
    }

    #[tokio::test]
    async fn test_empty_file_reads_nothing() {
        let (engine, _dir) = engine();
        engine.ping().await.unwrap();
        assert_eq!(engine.get(b"root:a").await.unwrap(), None);
        assert!(engine.scan_prefix(b"root:").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_and_prefix_scan() {
        let (engine, _dir) = engine();
        engine
            .apply_batch(&[
                BatchOp::put("root:a", "1"),
                BatchOp::put("root:b", "2"),
                BatchOp::put("roou", "outside"),
                BatchOp::put("stale", "x"),
            ])
            .await
            .unwrap();
        engine
            .apply_batch(&[BatchOp::delete("stale"), BatchOp::put("root:a", "10")])
            .await
            .unwrap();

        let scanned = engine.scan_prefix(b"root:").await.unwrap();
        assert_eq!(
            scanned,
            vec![
                (b"root:a".to_vec(), b"10".to_vec()),
                (b"root:b".to_vec(), b"2".to_vec()),
            ]
        );
        assert_eq!(engine.get(b"stale").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_commits_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("main.redb");
        {
            let engine = RedbBackend::open(&path).unwrap();
            engine
                .apply_batch(&[BatchOp::put("root:answer", "42")])
                .await
                .unwrap();
        }
        let engine = RedbBackend::open(&path).unwrap();
        assert_eq!(engine.path(), path.as_path());
        assert_eq!(
            engine.get(b"root:answer").await.unwrap(),
            Some(b"42".to_vec())
        );
    }

    #[test]
    fn test_successor() {
        assert_eq!(successor(b"root:"), Some(b"root;".to_vec()));
        assert_eq!(successor(b"a\xff"), Some(b"b".to_vec()));
        assert_eq!(successor(b"\xff\xff"), None);
        assert_eq!(successor(b""), None);
    }
}
