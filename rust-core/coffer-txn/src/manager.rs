// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! Transaction lifecycle and two-phase commit.
//!
//! # Transaction State Machine
//!
//! ```text
//!          begin()            commit()
//!   Idle ──────────> Active ───────────> Committed
//!                     │    \
//!              doom() │     \ abort() / failed vote
//!                     ▼      ▼
//!                  Doomed ──────abort()──────> Aborted
//! ```
//!
//! A doomed transaction can only be aborted; `commit()` on it fails with
//! [`TransactionError::Doomed`] without touching any resource.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::TransactionError;

/// Unique identifier for a transaction.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Generate a new unique transaction ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.0.simple().to_string();
        write!(f, "txn_{}", &hex[..12])
    }
}

/// The lifecycle state of the manager's current transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    /// No transaction has been begun yet.
    Idle,
    /// Open and accepting changes.
    Active,
    /// Open, but marked to abort at resolution time.
    Doomed,
    /// Resolved successfully.
    Committed,
    /// Resolved by discarding all changes.
    Aborted,
}

impl TransactionState {
    /// True while the transaction can still be resolved.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Active | Self::Doomed)
    }
}

/// What a resource learns about the transaction it is being asked to
/// vote on, finish or abort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInfo {
    pub id: TransactionId,
    pub started_at: DateTime<Utc>,
}

/// A resource holding uncommitted changes on behalf of a transaction.
///
/// Commit runs in two phases over every joined resource, ordered by
/// [`DataManager::sort_key`]:
///
/// 1. `tpc_vote` on all resources. Any error aborts every resource.
/// 2. `tpc_finish` on all resources, making the changes durable.
///
/// `abort` is synchronous so a resource can also be released from a
/// `Drop` implementation when a request is cancelled.
#[async_trait]
pub trait DataManager: Send + Sync {
    /// Key used to order resources within one commit.
    fn sort_key(&self) -> String;

    /// Validate that the changes can be committed.
    async fn tpc_vote(&self, txn: &TransactionInfo) -> Result<(), TransactionError>;

    /// Make the changes durable and visible to later transactions.
    async fn tpc_finish(&self, txn: &TransactionInfo) -> Result<(), TransactionError>;

    /// Discard all changes made under `txn`.
    fn abort(&self, txn: &TransactionInfo);
}

/// Coordinates one logical transaction at a time.
///
/// Owned by a single request context; it is never shared, so every
/// operation takes `&mut self`.
pub struct TransactionManager {
    state: TransactionState,
    info: Option<TransactionInfo>,
    resources: Vec<Arc<dyn DataManager>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            state: TransactionState::Idle,
            info: None,
            resources: Vec::new(),
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Details of the current (or last resolved) transaction.
    pub fn info(&self) -> Option<&TransactionInfo> {
        self.info.as_ref()
    }

    /// Number of resources joined to the current transaction.
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Begin a new transaction.
    ///
    /// An open transaction is aborted first, so `begin` always leaves a
    /// fresh Active transaction with no resources joined.
    pub fn begin(&mut self) -> TransactionId {
        if self.state.is_open() {
            warn!("begin() called with an open transaction; aborting it");
            self.abort_resources();
        }

        let info = TransactionInfo {
            id: TransactionId::new(),
            started_at: Utc::now(),
        };
        let id = info.id;
        debug!(txn_id = %id, "Transaction started");

        self.info = Some(info);
        self.state = TransactionState::Active;
        self.resources.clear();
        id
    }

    /// Join a resource to the open transaction.
    pub fn join(&mut self, resource: Arc<dyn DataManager>) -> Result<(), TransactionError> {
        if !self.state.is_open() {
            return Err(TransactionError::InvalidState {
                current: self.state,
                expected: "Active or Doomed",
            });
        }
        self.resources.push(resource);
        Ok(())
    }

    /// Mark the open transaction so that it can only be aborted.
    pub fn doom(&mut self) -> Result<(), TransactionError> {
        match self.state {
            TransactionState::Active => {
                self.state = TransactionState::Doomed;
                if let Some(info) = &self.info {
                    debug!(txn_id = %info.id, "Transaction doomed");
                }
                Ok(())
            }
            TransactionState::Doomed => Ok(()),
            current => Err(TransactionError::InvalidState {
                current,
                expected: "Active or Doomed",
            }),
        }
    }

    pub fn is_doomed(&self) -> bool {
        self.state == TransactionState::Doomed
    }

    /// Commit the open transaction through both phases.
    ///
    /// On failure every joined resource has been aborted, the state is
    /// Aborted, and the resource's error is returned as-is.
    pub async fn commit(&mut self) -> Result<(), TransactionError> {
        let info = match (self.state, &self.info) {
            (TransactionState::Active, Some(info)) => info.clone(),
            (TransactionState::Doomed, Some(info)) => {
                return Err(TransactionError::Doomed(info.id));
            }
            (current, _) => {
                return Err(TransactionError::InvalidState {
                    current,
                    expected: "Active",
                });
            }
        };

        self.resources.sort_by_key(|r| r.sort_key());
        let resources = self.resources.clone();

        for resource in &resources {
            if let Err(e) = resource.tpc_vote(&info).await {
                warn!(txn_id = %info.id, error = %e, "Vote failed; aborting transaction");
                self.abort_resources();
                return Err(e);
            }
        }

        for resource in &resources {
            if let Err(e) = resource.tpc_finish(&info).await {
                warn!(txn_id = %info.id, error = %e, "Finish failed; aborting transaction");
                self.abort_resources();
                return Err(e);
            }
        }

        info!(txn_id = %info.id, resources = resources.len(), "Transaction committed");
        self.state = TransactionState::Committed;
        self.resources.clear();
        Ok(())
    }

    /// Abort the open transaction, discarding every joined resource's
    /// changes. Returns how many resources were aborted.
    pub fn abort(&mut self) -> Result<usize, TransactionError> {
        if !self.state.is_open() {
            return Err(TransactionError::InvalidState {
                current: self.state,
                expected: "Active or Doomed",
            });
        }
        let aborted = self.abort_resources();
        if let Some(info) = &self.info {
            warn!(txn_id = %info.id, resources = aborted, "Transaction aborted");
        }
        Ok(aborted)
    }

    fn abort_resources(&mut self) -> usize {
        let count = self.resources.len();
        if let Some(info) = &self.info {
            for resource in &self.resources {
                resource.abort(info);
            }
        }
        self.resources.clear();
        self.state = TransactionState::Aborted;
        count
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("state", &self.state)
            .field("info", &self.info)
            .field("resources", &self.resources.len())
            .finish()
    }
}
