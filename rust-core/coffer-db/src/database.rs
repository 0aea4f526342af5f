// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! The database handle and its connection pool.
//!
//! One [`Database`] wraps exactly one storage engine. [`Database::open`]
//! leases a [`Connection`]; closing the connection hands its object cache
//! and transfer counters back to the idle pool, where the next `open` picks
//! them up again.
//!
//! The handle also owns the commit bookkeeping shared by all connections:
//! a global commit serial, the serial at which each key was last written,
//! and the lock that serializes the vote and finish phases of concurrent
//! commits.
//!
//! Per-key serials at or below the oldest snapshot still held by a leased
//! connection carry no information any open transaction needs, so they are
//! pruned once the map grows. A pruned key reports the highest pruned
//! serial instead; that value never decreases and every later write to the
//! key gets a larger one, so cache checks stay exact.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use coffer_storage::{InMemoryBackend, StorageBackend};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::activity::ActivityMonitor;
use crate::connection::{Connection, ConnectionId, ConnectionResources, TransferCounts};
use crate::error::DbResult;
use crate::options::DatabaseOptions;

struct IdleConnection {
    returned_at: Instant,
    resources: ConnectionResources,
}

#[derive(Default)]
struct Pool {
    idle: Vec<IdleConnection>,
    leased: usize,
}

/// Tracked keys below which the serial map is never pruned.
const PRUNE_MIN: usize = 1024;

#[derive(Default)]
struct Serials {
    last: u64,
    keys: HashMap<String, u64>,
    /// Highest serial dropped from `keys`.
    floor: u64,
    prune_at: usize,
    /// Snapshot serials of leased connections, with holder counts.
    pinned: BTreeMap<u64, usize>,
}

impl Serials {
    fn of(&self, key: &str) -> u64 {
        self.keys.get(key).copied().unwrap_or(self.floor)
    }

    fn pin(&mut self) -> u64 {
        *self.pinned.entry(self.last).or_default() += 1;
        self.last
    }

    fn unpin(&mut self, serial: u64) {
        if let Entry::Occupied(mut held) = self.pinned.entry(serial) {
            *held.get_mut() -= 1;
            if *held.get() == 0 {
                held.remove();
            }
        }
    }

    fn prune(&mut self) {
        let horizon = self.pinned.keys().next().copied().unwrap_or(self.last);
        let before = self.keys.len();
        let mut floor = self.floor;
        self.keys.retain(|_, serial| {
            let keep = *serial > horizon;
            if !keep {
                floor = floor.max(*serial);
            }
            keep
        });
        self.floor = floor;
        self.prune_at = (self.keys.len() * 2).max(PRUNE_MIN);
        trace!(horizon, floor, pruned = before - self.keys.len(), "Key serials pruned");
    }
}

struct DatabaseInner {
    storage: Arc<dyn StorageBackend>,
    options: DatabaseOptions,
    monitor: RwLock<Option<Arc<ActivityMonitor>>>,
    pool: Mutex<Pool>,
    serials: RwLock<Serials>,
    commit_lock: Arc<tokio::sync::Mutex<()>>,
    next_connection_id: AtomicU64,
}

/// A pooled object database over one storage engine.
///
/// Cloning is cheap; every clone refers to the same pool.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    pub fn new(storage: Arc<dyn StorageBackend>, options: DatabaseOptions) -> Self {
        debug!(
            database = %options.database_name,
            storage = storage.name(),
            pool_size = options.pool_size,
            "Database created"
        );
        Self {
            inner: Arc::new(DatabaseInner {
                storage,
                options,
                monitor: RwLock::new(None),
                pool: Mutex::new(Pool::default()),
                serials: RwLock::new(Serials::default()),
                commit_lock: Arc::new(tokio::sync::Mutex::new(())),
                next_connection_id: AtomicU64::new(1),
            }),
        }
    }

    /// A database over a fresh in-memory engine with default options.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryBackend::new()), DatabaseOptions::default())
    }

    pub fn options(&self) -> &DatabaseOptions {
        &self.inner.options
    }

    pub fn database_name(&self) -> &str {
        &self.inner.options.database_name
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.inner.storage
    }

    pub fn storage_name(&self) -> &str {
        self.inner.storage.name()
    }

    pub fn pool_size(&self) -> usize {
        self.inner.options.pool_size
    }

    /// Install (or remove) the monitor that records connection activity.
    pub fn set_activity_monitor(&self, monitor: Option<Arc<ActivityMonitor>>) {
        *self.inner.monitor.write() = monitor;
    }

    pub fn activity_monitor(&self) -> Option<Arc<ActivityMonitor>> {
        self.inner.monitor.read().clone()
    }

    /// Lease a connection.
    ///
    /// The engine is pinged first and its error is returned unchanged if it
    /// cannot serve connections. An idle pooled connection is reused when
    /// one is available and younger than the pool timeout.
    pub async fn open(&self) -> DbResult<Connection> {
        self.inner.storage.ping().await?;

        let (resources, reused, leased) = {
            let mut pool = self.inner.pool.lock();
            if let Some(timeout) = self.inner.options.pool_timeout() {
                let before = pool.idle.len();
                pool.idle.retain(|c| c.returned_at.elapsed() < timeout);
                let expired = before - pool.idle.len();
                if expired > 0 {
                    debug!(database = %self.database_name(), expired, "Discarded expired idle connections");
                }
            }
            pool.leased += 1;
            let (resources, reused) = match pool.idle.pop() {
                Some(idle) => (idle.resources, true),
                None => (ConnectionResources::new(self.next_connection_id()), false),
            };
            (resources, reused, pool.leased)
        };

        if leased > self.pool_size() {
            warn!(
                database = %self.database_name(),
                leased,
                pool_size = self.pool_size(),
                "Connection pool size exceeded"
            );
        }
        if let Some(monitor) = self.activity_monitor() {
            monitor.connection_opened();
        }
        debug!(database = %self.database_name(), connection = %resources.id(), reused, "Connection opened");

        Ok(Connection::new(self.clone(), resources))
    }

    /// Connections leased and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.inner.pool.lock().leased
    }

    /// Closed connections waiting in the pool for reuse.
    pub fn idle_connections(&self) -> usize {
        self.inner.pool.lock().idle.len()
    }

    /// Serial of the most recent commit; zero before the first.
    pub fn last_transaction(&self) -> u64 {
        self.inner.serials.read().last
    }

    fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Serial at which `key` was last written, or the prune floor if its
    /// entry has been dropped.
    pub(crate) fn key_serial(&self, key: &str) -> u64 {
        self.inner.serials.read().of(key)
    }

    /// Keys whose last-write serial is still tracked individually.
    pub fn tracked_keys(&self) -> usize {
        self.inner.serials.read().keys.len()
    }

    /// Pin the current commit serial as a connection snapshot.
    pub(crate) fn pin_snapshot(&self) -> u64 {
        self.inner.serials.write().pin()
    }

    /// Move a connection's snapshot from `old` to the current serial.
    pub(crate) fn repin_snapshot(&self, old: u64) -> u64 {
        let mut serials = self.inner.serials.write();
        serials.unpin(old);
        serials.pin()
    }

    pub(crate) fn commit_lock(&self) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(&self.inner.commit_lock)
    }

    /// Assign the next commit serial to `keys`. Callers hold the commit lock.
    pub(crate) fn record_commit<'a>(&self, keys: impl IntoIterator<Item = &'a String>) -> u64 {
        let mut serials = self.inner.serials.write();
        serials.last += 1;
        let serial = serials.last;
        for key in keys {
            serials.keys.insert(key.clone(), serial);
        }
        if serials.keys.len() >= serials.prune_at.max(PRUNE_MIN) {
            serials.prune();
        }
        serial
    }

    /// Return a closed connection's resources to the idle pool and drop
    /// its snapshot pin.
    pub(crate) fn release(
        &self,
        resources: ConnectionResources,
        lease: TransferCounts,
        snapshot: u64,
    ) {
        self.inner.serials.write().unpin(snapshot);
        {
            let mut pool = self.inner.pool.lock();
            pool.leased = pool.leased.saturating_sub(1);
            pool.idle.push(IdleConnection {
                returned_at: Instant::now(),
                resources,
            });
            if pool.idle.len() > self.pool_size() {
                pool.idle.remove(0);
            }
        }
        if let Some(monitor) = self.activity_monitor() {
            monitor.connection_closed(lease);
        }
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.database_name())
            .field("storage", &self.storage_name())
            .field("open_connections", &self.open_connections())
            .field("idle_connections", &self.idle_connections())
            .finish()
    }
}
