// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! Per-request connection state.
//!
//! # Teardown State Machine
//!
//! ```text
//!                 connection()
//!   NotConnected ─────────────> Connected
//!        │                          │ teardown: will-close signal
//!        │                          ▼
//!        │                       Closing  commit, or abort on failure/doom
//!        │                          │     capture and clear counts, close
//!        │ teardown (no-op)         ▼     closed signal
//!        └───────────────────────> Closed
//! ```
//!
//! A context dropped while Connected (a cancelled request) aborts its
//! transaction and returns the connection from `Drop`.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use coffer_db::{Connection, RootMapping, TransferCounts};
use coffer_txn::{TransactionManager, TransactionState};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::{Application, EXTENSION_KEY};
use crate::error::RequestError;
use crate::signals::{Signal, Signals};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TeardownState {
    NotConnected,
    Connected,
    Closing,
    Closed,
}

struct OpenConnection {
    connection: Connection,
    baseline: TransferCounts,
}

/// Holds at most one connection for one request.
pub struct RequestContext {
    id: Uuid,
    app: Arc<Application>,
    state: TeardownState,
    open: Option<OpenConnection>,
    txn: TransactionManager,
    final_transfers: Option<TransferCounts>,
}

impl RequestContext {
    pub(crate) fn new(app: Arc<Application>) -> Self {
        Self {
            id: Uuid::new_v4(),
            app,
            state: TeardownState::NotConnected,
            open: None,
            txn: TransactionManager::new(),
            final_transfers: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn application(&self) -> &Arc<Application> {
        &self.app
    }

    pub fn teardown_state(&self) -> TeardownState {
        self.state
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.txn.state()
    }

    pub fn is_connected(&self) -> bool {
        self.open.is_some()
    }

    /// The request's connection, opened on first call.
    ///
    /// Opening leases a connection from the application's pool (building
    /// the pool if needed), records the baseline transfer counts, begins
    /// the transaction and sends [`Signal::ConnectionOpened`].
    pub async fn connection(&mut self) -> Result<&Connection, RequestError> {
        if matches!(self.state, TeardownState::Closing | TeardownState::Closed) {
            return Err(RequestError::TornDown);
        }
        if self.open.is_none() {
            let state = self
                .app
                .extension(EXTENSION_KEY)
                .cloned()
                .ok_or(RequestError::NotInitialized)?;
            let db = state.database(self.app.config()).await?;
            let connection = db.open().await?;
            let baseline = connection.transfer_counts(false)?;
            self.txn.begin();
            connection.join(&mut self.txn)?;

            debug!(request = %self.id, connection = %connection.id(), "Request connection opened");
            self.open = Some(OpenConnection {
                connection,
                baseline,
            });
            self.state = TeardownState::Connected;
            state.extension().signals().send(Signal::ConnectionOpened);
        }
        match &self.open {
            Some(open) => Ok(&open.connection),
            None => Err(RequestError::NotConnected),
        }
    }

    /// The persistent root mapping, opening the connection if needed.
    pub async fn data(&mut self) -> Result<RootMapping, RequestError> {
        Ok(self.connection().await?.root())
    }

    /// Live transfer counts of the open connection. Does not reset them.
    pub fn transfers(&self) -> Result<TransferCounts, RequestError> {
        let open = self.open.as_ref().ok_or(RequestError::NotConnected)?;
        Ok(open.connection.transfer_counts(false)?)
    }

    /// Counts the connection carried when this request opened it.
    pub fn baseline_transfers(&self) -> Option<TransferCounts> {
        self.open.as_ref().map(|o| o.baseline)
    }

    /// Counts captured (and cleared) at teardown.
    pub fn final_transfers(&self) -> Option<TransferCounts> {
        self.final_transfers
    }

    /// Force the transaction to abort at teardown.
    pub fn doom(&mut self) -> Result<(), RequestError> {
        if self.open.is_none() {
            return Err(RequestError::NotConnected);
        }
        self.txn.doom()?;
        Ok(())
    }

    pub fn is_doomed(&self) -> bool {
        self.txn.is_doomed()
    }

    pub(crate) async fn close_connection(
        &mut self,
        signals: &Signals,
        failure: Option<&(dyn Error + Send + Sync + 'static)>,
    ) -> Result<Option<TransferCounts>, RequestError> {
        match self.state {
            TeardownState::NotConnected => {
                self.state = TeardownState::Closed;
                return Ok(None);
            }
            TeardownState::Closing | TeardownState::Closed => {
                debug!(request = %self.id, "Teardown already ran");
                return Ok(self.final_transfers);
            }
            TeardownState::Connected => {}
        }
        let Some(open) = self.open.take() else {
            self.state = TeardownState::Closed;
            return Ok(None);
        };

        self.state = TeardownState::Closing;
        signals.send(Signal::ConnectionWillClose);

        let doomed = self.txn.is_doomed();
        let resolution = if failure.is_none() && !doomed {
            self.txn.commit().await.map_err(RequestError::from)
        } else {
            if let Some(err) = failure {
                debug!(request = %self.id, error = %err, "Request failed; aborting");
            }
            self.txn.abort().map(|_| ()).map_err(RequestError::from)
        };

        let captured = open.connection.transfer_counts(true);
        self.final_transfers = captured.as_ref().ok().copied();
        open.connection.close();
        signals.send(Signal::ConnectionClosed);
        self.state = TeardownState::Closed;

        info!(
            request = %self.id,
            outcome = ?self.txn.state(),
            doomed,
            transfers = ?self.final_transfers,
            "Request connection closed"
        );
        resolution?;
        let counts = captured.map_err(|e| {
            warn!(request = %self.id, error = %e, "Transfer counts unavailable at teardown");
            RequestError::from(e)
        })?;
        Ok(Some(counts))
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        let Some(open) = self.open.take() else {
            return;
        };
        warn!(
            request = %self.id,
            connection = %open.connection.id(),
            "Request context dropped before teardown; aborting its transaction"
        );
        let signals = self
            .app
            .extension(EXTENSION_KEY)
            .map(|state| Arc::clone(state.extension().signals()));
        if let Some(signals) = &signals {
            signals.send(Signal::ConnectionWillClose);
        }
        if self.txn.state().is_open() {
            let _ = self.txn.abort();
        }
        self.final_transfers = open.connection.transfer_counts(true).ok();
        open.connection.close();
        if let Some(signals) = &signals {
            signals.send(Signal::ConnectionClosed);
        }
        self.state = TeardownState::Closed;
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("id", &self.id)
            .field("app", &self.app.name())
            .field("state", &self.state)
            .field("transaction", &self.txn.state())
            .field("connection", &self.open.as_ref().map(|o| o.connection.id()))
            .finish()
    }
}
