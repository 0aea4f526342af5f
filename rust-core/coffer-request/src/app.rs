// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! The host application.
//!
//! An [`Application`] is configured and has its extensions bound while it
//! is still exclusively owned. It is then shared behind an `Arc` and serves
//! requests through [`Application::request`], which guarantees teardown.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use coffer_db::{Database, StorageConfig, UriRegistry};
use futures::future::BoxFuture;
use serde::Serialize;
use tracing::{debug, warn};

use crate::context::RequestContext;
use crate::error::RequestError;
use crate::extension::ApplicationState;

/// Key under which the Coffer extension registers itself.
pub const EXTENSION_KEY: &str = "coffer";

/// Host configuration read by the extension.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    /// The `COFFER_STORAGE` setting.
    pub storage: Option<StorageConfig>,
    /// Schemes available to `StorageConfig::Uri`.
    pub uri_registry: UriRegistry,
}

impl AppConfig {
    pub fn with_storage(storage: impl Into<StorageConfig>) -> Self {
        Self {
            storage: Some(storage.into()),
            ..Self::default()
        }
    }
}

/// Work run once at the end of every request, whatever its outcome.
#[async_trait]
pub trait TeardownHook: Send + Sync {
    async fn on_teardown(
        &self,
        ctx: &mut RequestContext,
        failure: Option<&(dyn Error + Send + Sync + 'static)>,
    ) -> Result<(), RequestError>;
}

pub struct Application {
    name: String,
    config: AppConfig,
    extensions: HashMap<&'static str, Arc<ApplicationState>>,
    teardown_hooks: Vec<Arc<dyn TeardownHook>>,
}

/// Snapshot of an application's bindings, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ApplicationInfo {
    pub name: String,
    pub extensions: Vec<&'static str>,
    pub teardown_hooks: usize,
}

impl Application {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, AppConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: AppConfig) -> Self {
        Self {
            name: name.into(),
            config,
            extensions: HashMap::new(),
            teardown_hooks: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut AppConfig {
        &mut self.config
    }

    /// Set `COFFER_STORAGE`. The pool is built from it on first use, so
    /// this may happen after the extension is bound.
    pub fn set_storage(&mut self, storage: impl Into<StorageConfig>) {
        self.config.storage = Some(storage.into());
    }

    /// Bind extension state under `key`. Binding the same key twice fails.
    pub fn register_extension(
        &mut self,
        key: &'static str,
        state: Arc<ApplicationState>,
    ) -> Result<(), RequestError> {
        if self.extensions.contains_key(key) {
            return Err(RequestError::DoubleInitialization(self.name.clone()));
        }
        self.extensions.insert(key, state);
        debug!(app = %self.name, extension = key, "Extension registered");
        Ok(())
    }

    pub fn extension(&self, key: &str) -> Option<&Arc<ApplicationState>> {
        self.extensions.get(key)
    }

    pub fn add_teardown_hook(&mut self, hook: Arc<dyn TeardownHook>) {
        self.teardown_hooks.push(hook);
    }

    pub fn info(&self) -> ApplicationInfo {
        let mut extensions: Vec<&'static str> = self.extensions.keys().copied().collect();
        extensions.sort_unstable();
        ApplicationInfo {
            name: self.name.clone(),
            extensions,
            teardown_hooks: self.teardown_hooks.len(),
        }
    }

    /// The Coffer database, built on first call.
    pub async fn database(&self) -> Result<Database, RequestError> {
        let state = self
            .extension(EXTENSION_KEY)
            .ok_or(RequestError::NotInitialized)?;
        Ok(state.database(&self.config).await?.clone())
    }

    /// A fresh request context. The caller is responsible for calling
    /// [`Application::teardown`]; prefer [`Application::request`].
    pub fn context(self: &Arc<Self>) -> RequestContext {
        RequestContext::new(Arc::clone(self))
    }

    /// Run every teardown hook, most recently registered first.
    ///
    /// All hooks run even if one fails; the first failure is returned.
    pub async fn teardown(
        &self,
        ctx: &mut RequestContext,
        failure: Option<&(dyn Error + Send + Sync + 'static)>,
    ) -> Result<(), RequestError> {
        let mut first_error = None;
        for hook in self.teardown_hooks.iter().rev() {
            if let Err(e) = hook.on_teardown(ctx, failure).await {
                if first_error.is_some() {
                    warn!(app = %self.name, error = %e, "Additional teardown failure");
                } else {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Run `handler` inside a request context and always tear it down.
    ///
    /// The handler's error is the failure indicator passed to teardown and
    /// is returned afterwards. When the handler succeeds but teardown fails
    /// (for example a commit conflict), the teardown error is returned.
    pub async fn request<T, E, F>(self: &Arc<Self>, handler: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut RequestContext) -> BoxFuture<'c, Result<T, E>>,
        E: Error + From<RequestError> + Send + Sync + 'static,
    {
        let mut ctx = self.context();
        let outcome = handler(&mut ctx).await;
        let failure = outcome
            .as_ref()
            .err()
            .map(|e| e as &(dyn Error + Send + Sync + 'static));
        let torn_down = self.teardown(&mut ctx, failure).await;

        match (outcome, torn_down) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(E::from(e)),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(teardown_error)) => {
                warn!(
                    app = %self.name,
                    request = %ctx.id(),
                    error = %teardown_error,
                    "Teardown failed after request error"
                );
                Err(e)
            }
        }
    }
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("extensions", &self.info().extensions)
            .field("teardown_hooks", &self.teardown_hooks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::Coffer;
    use parking_lot::Mutex;

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl TeardownHook for Recording {
        async fn on_teardown(
            &self,
            _ctx: &mut RequestContext,
            failure: Option<&(dyn Error + Send + Sync + 'static)>,
        ) -> Result<(), RequestError> {
            self.log
                .lock()
                .push(format!("{}:{}", self.name, failure.map_or("ok".to_string(), |e| e.to_string())));
            if self.fail {
                return Err(RequestError::application(format!("{} failed", self.name)));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_hooks_run_in_reverse_and_all_run() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut app = Application::new("hooks");
        for (name, fail) in [("first", true), ("second", true), ("third", false)] {
            app.add_teardown_hook(Arc::new(Recording {
                name,
                log: Arc::clone(&log),
                fail,
            }));
        }
        let app = Arc::new(app);

        let result: Result<(), RequestError> = app
            .request(|_ctx| Box::pin(async { Err(RequestError::application("boom")) }))
            .await;
        // The handler's own error wins over teardown failures.
        assert_eq!(result.unwrap_err().to_string(), "boom");
        assert_eq!(
            *log.lock(),
            vec!["third:boom", "second:boom", "first:boom"]
        );

        log.lock().clear();
        let result: Result<(), RequestError> =
            app.request(|_ctx| Box::pin(async { Ok(()) })).await;
        assert_eq!(result.unwrap_err().to_string(), "second failed");
        assert_eq!(*log.lock(), vec!["third:ok", "second:ok", "first:ok"]);
    }

    #[test]
    fn test_register_extension_twice_fails() {
        let mut app = Application::new("twice");
        let coffer = Coffer::new();
        app.register_extension(EXTENSION_KEY, Arc::new(ApplicationState::new(coffer.clone())))
            .unwrap();
        let err = app
            .register_extension(EXTENSION_KEY, Arc::new(ApplicationState::new(coffer)))
            .unwrap_err();
        assert!(matches!(err, RequestError::DoubleInitialization(name) if name == "twice"));
    }

    #[tokio::test]
    async fn test_database_requires_extension() {
        let app = Application::with_config("bare", AppConfig::with_storage("memory://"));
        assert!(matches!(
            app.database().await,
            Err(RequestError::NotInitialized)
        ));
        assert!(app.info().extensions.is_empty());
    }
}
