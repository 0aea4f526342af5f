// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! Leased connections.
//!
//! A [`Connection`] reads objects from the engine and buffers writes until
//! the transaction it joined commits. It takes part in the two-phase commit
//! as a [`DataManager`]:
//!
//! - **vote** takes the database commit lock and checks every written key
//!   against the serial it had when this transaction first saw it. A key
//!   written by someone else since then fails the vote with
//!   [`TransactionError::Conflict`] (first committer wins).
//! - **finish** applies the write set as one atomic batch, advances the
//!   serials and releases the lock. These three steps run on a spawned
//!   task, so a cancelled commit either lands completely (serials
//!   included) or not at all.
//! - **abort** drops the write set and releases the lock if held.
//!
//! Each connection keeps a small object cache and transfer counters that
//! survive being returned to the pool.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use coffer_storage::{BatchOp, StorageError};
use coffer_txn::{DataManager, TransactionError, TransactionInfo, TransactionManager};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::database::Database;
use crate::error::{DbError, DbResult};
use crate::root::RootMapping;

/// Identifies a pooled connection. Stable across reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Object transfer statistics for a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCounts {
    /// Objects read from the engine.
    pub loads: u64,
    /// Objects written to the engine by commits.
    pub stores: u64,
    pub bytes_loaded: u64,
    pub bytes_stored: u64,
}

impl TransferCounts {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    fn add_load(&mut self, bytes: usize) {
        self.loads += 1;
        self.bytes_loaded += bytes as u64;
    }

    fn add_stores(&mut self, objects: usize, bytes: usize) {
        self.stores += objects as u64;
        self.bytes_stored += bytes as u64;
    }
}

#[derive(Debug, Clone)]
struct CachedObject {
    serial: u64,
    data: Option<Vec<u8>>,
}

/// The part of a connection that outlives one lease.
pub(crate) struct ConnectionResources {
    id: ConnectionId,
    cache: HashMap<String, CachedObject>,
    counters: TransferCounts,
}

impl ConnectionResources {
    pub(crate) fn new(id: ConnectionId) -> Self {
        Self {
            id,
            cache: HashMap::new(),
            counters: TransferCounts::default(),
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    fn cache_insert(&mut self, key: String, object: CachedObject, capacity: usize) {
        if capacity == 0 {
            return;
        }
        if self.cache.len() >= capacity && !self.cache.contains_key(&key) {
            if let Some(evict) = self.cache.keys().next().cloned() {
                self.cache.remove(&evict);
            }
        }
        self.cache.insert(key, object);
    }
}

struct LeaseState {
    resources: ConnectionResources,
    /// Everything transferred during this lease, never cleared.
    lease: TransferCounts,
    snapshot_serial: u64,
    reads: HashMap<String, u64>,
    writes: BTreeMap<String, Option<Vec<u8>>>,
    commit_guard: Option<OwnedMutexGuard<()>>,
}

impl LeaseState {
    fn count_load(&mut self, bytes: usize) {
        self.resources.counters.add_load(bytes);
        self.lease.add_load(bytes);
    }

    fn reset_transaction(&mut self) {
        self.reads.clear();
        self.writes.clear();
        self.commit_guard = None;
    }
}

struct ConnectionInner {
    id: ConnectionId,
    db: Database,
    state: Mutex<Option<LeaseState>>,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if let Some(state) = self.state.get_mut().take() {
            warn!(connection = %self.id, "Connection dropped without close; returning it to the pool");
            self.db.release(state.resources, state.lease, state.snapshot_serial);
        }
    }
}

enum Lookup {
    Pending(Option<Vec<u8>>),
    Cached(Option<Vec<u8>>),
    Miss,
}

/// A connection leased from a [`Database`].
///
/// Clones share the same lease; the transaction manager holds one while
/// the connection is joined.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn new(db: Database, resources: ConnectionResources) -> Self {
        let id = resources.id;
        let snapshot_serial = db.pin_snapshot();
        Self {
            inner: Arc::new(ConnectionInner {
                id,
                db,
                state: Mutex::new(Some(LeaseState {
                    resources,
                    lease: TransferCounts::default(),
                    snapshot_serial,
                    reads: HashMap::new(),
                    writes: BTreeMap::new(),
                    commit_guard: None,
                })),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().is_none()
    }

    /// The application's persistent root mapping.
    pub fn root(&self) -> RootMapping {
        RootMapping::new(self.clone())
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut LeaseState) -> R) -> DbResult<R> {
        let mut guard = self.inner.state.lock();
        match guard.as_mut() {
            Some(state) => Ok(f(state)),
            None => Err(DbError::ConnectionClosed(self.inner.id)),
        }
    }

    /// Join `txn`, starting a fresh read and write set at the current
    /// commit serial.
    pub fn join(&self, txn: &mut TransactionManager) -> DbResult<()> {
        let db = &self.inner.db;
        self.with_state(|s| {
            s.reset_transaction();
            s.snapshot_serial = db.repin_snapshot(s.snapshot_serial);
        })?;
        txn.join(Arc::new(self.clone()))?;
        Ok(())
    }

    /// Read an object, seeing this transaction's own uncommitted writes.
    pub async fn load(&self, key: &str) -> DbResult<Option<Vec<u8>>> {
        let serial = self.inner.db.key_serial(key);
        let lookup = self.with_state(|s| {
            if let Some(pending) = s.writes.get(key) {
                return Lookup::Pending(pending.clone());
            }
            let seen = serial.max(s.snapshot_serial);
            s.reads.entry(key.to_string()).or_insert(seen);
            match s.resources.cache.get(key) {
                Some(obj) if obj.serial == serial => Lookup::Cached(obj.data.clone()),
                _ => Lookup::Miss,
            }
        })?;

        match lookup {
            Lookup::Pending(data) | Lookup::Cached(data) => Ok(data),
            Lookup::Miss => {
                let data = self.inner.db.storage().get(key.as_bytes()).await?;
                let capacity = self.inner.db.options().cache_size;
                self.with_state(|s| {
                    s.count_load(data.as_ref().map_or(0, Vec::len));
                    s.resources.cache_insert(
                        key.to_string(),
                        CachedObject {
                            serial,
                            data: data.clone(),
                        },
                        capacity,
                    );
                })?;
                Ok(data)
            }
        }
    }

    /// Buffer a write until commit.
    pub fn store(&self, key: &str, data: Vec<u8>) -> DbResult<()> {
        self.with_state(|s| {
            s.writes.insert(key.to_string(), Some(data));
        })
    }

    /// Buffer a delete until commit.
    pub fn delete(&self, key: &str) -> DbResult<()> {
        self.with_state(|s| {
            s.writes.insert(key.to_string(), None);
        })
    }

    /// Every object under `prefix`, committed state overlaid with this
    /// transaction's writes. Each committed object read counts as a load.
    pub async fn scan(&self, prefix: &str) -> DbResult<BTreeMap<String, Vec<u8>>> {
        self.with_state(|_| ())?;
        let rows = self
            .inner
            .db
            .storage()
            .scan_prefix(prefix.as_bytes())
            .await?;

        self.with_state(|s| {
            let mut merged = BTreeMap::new();
            for (key, value) in rows {
                s.count_load(value.len());
                if let Ok(key) = String::from_utf8(key) {
                    merged.insert(key, value);
                }
            }
            let pending = s
                .writes
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix));
            for (key, write) in pending {
                match write {
                    Some(value) => {
                        merged.insert(key.clone(), value.clone());
                    }
                    None => {
                        merged.remove(key);
                    }
                }
            }
            merged
        })
    }

    pub fn has_pending_changes(&self) -> bool {
        self.with_state(|s| !s.writes.is_empty()).unwrap_or(false)
    }

    /// Transfer counts since the last clear. With `clear`, the counters
    /// restart from zero after being read.
    pub fn transfer_counts(&self, clear: bool) -> DbResult<TransferCounts> {
        self.with_state(|s| {
            let counts = s.resources.counters;
            if clear {
                s.resources.counters = TransferCounts::default();
            }
            counts
        })
    }

    /// Return the connection to its pool.
    ///
    /// Uncommitted changes are discarded. Returns false if the connection
    /// was already closed.
    pub fn close(&self) -> bool {
        let Some(mut state) = self.inner.state.lock().take() else {
            return false;
        };
        if !state.writes.is_empty() {
            warn!(
                connection = %self.inner.id,
                discarded = state.writes.len(),
                "Closing connection with uncommitted changes"
            );
        }
        state.reset_transaction();
        self.inner
            .db
            .release(state.resources, state.lease, state.snapshot_serial);
        debug!(
            database = %self.inner.db.database_name(),
            connection = %self.inner.id,
            loads = state.lease.loads,
            stores = state.lease.stores,
            "Connection closed"
        );
        true
    }
}

#[async_trait]
impl DataManager for Connection {
    fn sort_key(&self) -> String {
        format!("{}:{:020}", self.inner.db.database_name(), self.inner.id.0)
    }

    async fn tpc_vote(&self, txn: &TransactionInfo) -> Result<(), TransactionError> {
        let has_writes = self.has_pending_changes();
        if !has_writes {
            return Ok(());
        }

        let guard = self.inner.db.commit_lock().lock_owned().await;
        let mut state = self.inner.state.lock();
        let Some(s) = state.as_mut() else {
            return Ok(());
        };
        for key in s.writes.keys() {
            let expected = s.reads.get(key).copied().unwrap_or(s.snapshot_serial);
            let actual = self.inner.db.key_serial(key);
            if actual > expected {
                debug!(txn_id = %txn.id, connection = %self.inner.id, key = %key, expected, actual, "Write conflict");
                return Err(TransactionError::Conflict {
                    key: key.clone(),
                    expected,
                    actual,
                });
            }
        }
        s.commit_guard = Some(guard);
        Ok(())
    }

    async fn tpc_finish(&self, txn: &TransactionInfo) -> Result<(), TransactionError> {
        let (ops, keys, guard) = {
            let mut state = self.inner.state.lock();
            match state.as_mut() {
                Some(s) if !s.writes.is_empty() => {
                    let ops: Vec<BatchOp> = s
                        .writes
                        .iter()
                        .map(|(key, write)| match write {
                            Some(data) => BatchOp::put(key.as_bytes(), data.as_slice()),
                            None => BatchOp::delete(key.as_bytes()),
                        })
                        .collect();
                    let keys: Vec<String> = s.writes.keys().cloned().collect();
                    (ops, keys, s.commit_guard.take())
                }
                _ => return Ok(()),
            }
        };

        // The engine write and the serial bump run on their own task, which
        // owns the commit lock. Dropping this future cannot separate them.
        let db = self.inner.db.clone();
        let batch = tokio::spawn(async move {
            let _guard = guard;
            db.storage().apply_batch(&ops).await?;
            let serial = db.record_commit(&keys);
            Ok::<_, StorageError>((serial, ops))
        });
        let (serial, ops) = batch.await.map_err(|e| {
            StorageError::BackendUnavailable(format!("commit task failed: {e}"))
        })??;

        let capacity = self.inner.db.options().cache_size;
        let mut state = self.inner.state.lock();
        let Some(s) = state.as_mut() else {
            return Ok(());
        };
        let bytes: usize = ops.iter().map(BatchOp::payload_len).sum();
        s.resources.counters.add_stores(ops.len(), bytes);
        s.lease.add_stores(ops.len(), bytes);
        for (key, data) in std::mem::take(&mut s.writes) {
            s.resources
                .cache_insert(key, CachedObject { serial, data }, capacity);
        }
        s.reset_transaction();
        debug!(txn_id = %txn.id, connection = %self.inner.id, serial, objects = ops.len(), "Changes stored");
        Ok(())
    }

    fn abort(&self, txn: &TransactionInfo) {
        let discarded = self
            .with_state(|s| {
                let discarded = s.writes.len();
                s.reset_transaction();
                discarded
            })
            .unwrap_or(0);
        debug!(txn_id = %txn.id, connection = %self.inner.id, discarded, "Changes discarded");
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("database", &self.inner.db.database_name())
            .field("closed", &self.is_closed())
            .finish()
    }
}
