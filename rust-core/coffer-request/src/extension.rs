// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! The Coffer extension and its per-application state.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use coffer_db::{create_database, ActivityMonitor, Database, DbError, TransferCounts};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::app::{AppConfig, Application, TeardownHook, EXTENSION_KEY};
use crate::context::RequestContext;
use crate::error::RequestError;
use crate::signals::{ListenerId, Signal, Signals};

/// Binds request-scoped persistence to an [`Application`].
///
/// The extension holds no connection state. It only carries the signal
/// hub; clones share it.
#[derive(Clone, Default)]
pub struct Coffer {
    signals: Arc<Signals>,
}

impl Coffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an existing signal hub, for example one shared with telemetry.
    pub fn with_signals(signals: Arc<Signals>) -> Self {
        Self { signals }
    }

    /// Create the extension and bind it to `app` in one step.
    pub fn with_app(app: &mut Application) -> Result<Self, RequestError> {
        let coffer = Self::new();
        coffer.init_app(app)?;
        Ok(coffer)
    }

    /// Bind to `app`: register the application state and the teardown hook.
    ///
    /// Fails with [`RequestError::DoubleInitialization`] if the application
    /// already has a Coffer extension.
    pub fn init_app(&self, app: &mut Application) -> Result<(), RequestError> {
        app.register_extension(EXTENSION_KEY, Arc::new(ApplicationState::new(self.clone())))?;
        app.add_teardown_hook(Arc::new(self.clone()));
        debug!(app = %app.name(), "Coffer initialized");
        Ok(())
    }

    pub fn signals(&self) -> &Arc<Signals> {
        &self.signals
    }

    pub fn on_connection_opened(&self, f: impl Fn() + Send + Sync + 'static) -> ListenerId {
        self.signals.connect(Signal::ConnectionOpened, f)
    }

    pub fn on_connection_will_close(&self, f: impl Fn() + Send + Sync + 'static) -> ListenerId {
        self.signals.connect(Signal::ConnectionWillClose, f)
    }

    pub fn on_connection_closed(&self, f: impl Fn() + Send + Sync + 'static) -> ListenerId {
        self.signals.connect(Signal::ConnectionClosed, f)
    }

    /// True if both handles are the same extension.
    pub fn ptr_eq(&self, other: &Coffer) -> bool {
        Arc::ptr_eq(&self.signals, &other.signals)
    }

    /// Resolve and close the request's connection.
    ///
    /// Commits when `failure` is `None` and the transaction is not doomed,
    /// aborts otherwise. Returns the transfer counts captured just before
    /// close, or `None` if the request never connected. Commit errors are
    /// returned after the connection has been released.
    pub async fn teardown(
        &self,
        ctx: &mut RequestContext,
        failure: Option<&(dyn Error + Send + Sync + 'static)>,
    ) -> Result<Option<TransferCounts>, RequestError> {
        ctx.close_connection(&self.signals, failure).await
    }
}

#[async_trait]
impl TeardownHook for Coffer {
    async fn on_teardown(
        &self,
        ctx: &mut RequestContext,
        failure: Option<&(dyn Error + Send + Sync + 'static)>,
    ) -> Result<(), RequestError> {
        self.teardown(ctx, failure).await.map(|_| ())
    }
}

impl fmt::Debug for Coffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coffer")
            .field("signals", &self.signals)
            .finish()
    }
}

/// What the extension keeps per application: the lazily built pool.
pub struct ApplicationState {
    extension: Coffer,
    db: OnceCell<Database>,
}

impl ApplicationState {
    pub fn new(extension: Coffer) -> Self {
        Self {
            extension,
            db: OnceCell::new(),
        }
    }

    pub fn extension(&self) -> &Coffer {
        &self.extension
    }

    /// The application's database, built from `config` on first call.
    ///
    /// Concurrent first calls build it once; the others wait for it. A
    /// failed build is not cached, so a later call tries again.
    pub async fn database(&self, config: &AppConfig) -> Result<&Database, DbError> {
        self.db
            .get_or_try_init(|| async {
                let db = create_database(config.storage.as_ref(), &config.uri_registry)?;
                let monitor = ActivityMonitor::new(db.options().history_length());
                db.set_activity_monitor(Some(Arc::new(monitor)));
                info!(
                    database = %db.database_name(),
                    storage = db.storage_name(),
                    pool_size = db.pool_size(),
                    "Connection pool ready"
                );
                Ok(db)
            })
            .await
    }

    /// The database if it has been built already.
    pub fn built_database(&self) -> Option<&Database> {
        self.db.get()
    }
}

impl fmt::Debug for ApplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationState")
            .field("extension", &self.extension)
            .field("database", &self.db.get())
            .finish()
    }
}
