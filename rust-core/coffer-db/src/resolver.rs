// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! Turning storage configuration into a [`Database`].
//!
//! The `COFFER_STORAGE` setting takes one of three shapes:
//!
//! | Shape                      | Factory                       | Options           |
//! |----------------------------|-------------------------------|-------------------|
//! | [`StorageConfig::Uri`]     | looked up by URI scheme       | URI query string  |
//! | [`StorageConfig::Factory`] | as given                      | kwargs as given   |
//! | [`StorageConfig::Bare`]    | as given                      | defaults          |
//!
//! URI schemes are resolved through a [`UriRegistry`]. `memory://` is always
//! available; `redb://` and `file://` come with the `redb-backend` feature.
//! Hosts register their own schemes with [`UriRegistry::register`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use coffer_storage::{InMemoryBackend, StorageBackend, StorageError};
use tracing::info;
use url::Url;

use crate::database::Database;
use crate::error::DbError;
use crate::options::{DatabaseOptions, Kwargs};

/// Name of the configuration key that selects the storage engine.
pub const STORAGE_CONFIG_KEY: &str = "COFFER_STORAGE";

/// Builds a storage engine.
pub trait StorageFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn StorageBackend>, StorageError>;
}

impl<F> StorageFactory for F
where
    F: Fn() -> Result<Arc<dyn StorageBackend>, StorageError> + Send + Sync,
{
    fn create(&self) -> Result<Arc<dyn StorageBackend>, StorageError> {
        self()
    }
}

/// The value of the `COFFER_STORAGE` setting.
#[derive(Clone)]
pub enum StorageConfig {
    /// A storage URI such as `memory://` or `redb:///var/lib/app.redb`.
    Uri(String),
    /// A factory plus keyword arguments for the database.
    Factory {
        factory: Arc<dyn StorageFactory>,
        kwargs: Kwargs,
    },
    /// A factory used with default options.
    Bare(Arc<dyn StorageFactory>),
}

impl StorageConfig {
    pub fn uri(uri: impl Into<String>) -> Self {
        Self::Uri(uri.into())
    }

    pub fn factory(factory: impl StorageFactory + 'static, kwargs: Kwargs) -> Self {
        Self::Factory {
            factory: Arc::new(factory),
            kwargs,
        }
    }

    pub fn bare(factory: impl StorageFactory + 'static) -> Self {
        Self::Bare(Arc::new(factory))
    }

    /// Short name of the configuration shape, for logs.
    pub fn shape(&self) -> &'static str {
        match self {
            Self::Uri(_) => "uri",
            Self::Factory { .. } => "factory",
            Self::Bare(_) => "bare",
        }
    }
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uri(uri) => f.debug_tuple("Uri").field(uri).finish(),
            Self::Factory { kwargs, .. } => f
                .debug_struct("Factory")
                .field("kwargs", kwargs)
                .finish_non_exhaustive(),
            Self::Bare(_) => f.write_str("Bare(..)"),
        }
    }
}

impl From<&str> for StorageConfig {
    fn from(uri: &str) -> Self {
        Self::Uri(uri.to_string())
    }
}

impl From<String> for StorageConfig {
    fn from(uri: String) -> Self {
        Self::Uri(uri)
    }
}

/// Resolves one URI scheme to a storage factory and database kwargs.
pub trait UriResolver: Send + Sync {
    fn resolve(&self, uri: &Url) -> Result<(Arc<dyn StorageFactory>, Kwargs), DbError>;
}

/// Query string of `uri` as kwargs.
pub fn query_kwargs(uri: &Url) -> Kwargs {
    uri.query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// `memory://[name][?kwargs]`: a fresh in-memory engine per resolution.
/// The optional name becomes the default `database_name`.
struct MemoryResolver;

impl UriResolver for MemoryResolver {
    fn resolve(&self, uri: &Url) -> Result<(Arc<dyn StorageFactory>, Kwargs), DbError> {
        let mut kwargs = query_kwargs(uri);
        if let Some(name) = uri.host_str().filter(|h| !h.is_empty()) {
            kwargs
                .entry("database_name".to_string())
                .or_insert_with(|| name.to_string());
        }
        let factory: Arc<dyn StorageFactory> =
            Arc::new(|| -> Result<Arc<dyn StorageBackend>, StorageError> {
                Ok(Arc::new(InMemoryBackend::new()))
            });
        Ok((factory, kwargs))
    }
}

/// `redb:///path/to/file.redb[?kwargs]` and the `file://` equivalent.
#[cfg(feature = "redb-backend")]
struct RedbResolver;

#[cfg(feature = "redb-backend")]
impl UriResolver for RedbResolver {
    fn resolve(&self, uri: &Url) -> Result<(Arc<dyn StorageFactory>, Kwargs), DbError> {
        use coffer_storage::RedbBackend;

        if uri.path().is_empty() || uri.path() == "/" {
            return Err(DbError::config(format!("'{uri}' has no file path")));
        }
        let not_local = || DbError::config(format!("'{uri}' does not name a local file"));
        let file_url = if uri.scheme() == "file" {
            uri.clone()
        } else {
            Url::parse(&format!("file://{}", uri.path())).map_err(|_| not_local())?
        };
        let path = file_url.to_file_path().map_err(|_| not_local())?;
        let factory: Arc<dyn StorageFactory> =
            Arc::new(move || -> Result<Arc<dyn StorageBackend>, StorageError> {
                Ok(Arc::new(RedbBackend::open(&path)?))
            });
        Ok((factory, query_kwargs(uri)))
    }
}

/// Scheme to resolver lookup table.
#[derive(Clone)]
pub struct UriRegistry {
    resolvers: HashMap<String, Arc<dyn UriResolver>>,
}

impl UriRegistry {
    /// A registry with no schemes.
    pub fn empty() -> Self {
        Self {
            resolvers: HashMap::new(),
        }
    }

    /// A registry with the built-in schemes.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("memory", MemoryResolver);
        #[cfg(feature = "redb-backend")]
        {
            registry.register("redb", RedbResolver);
            registry.register("file", RedbResolver);
        }
        registry
    }

    /// Register `resolver` for `scheme`, returning the resolver it replaced.
    pub fn register(
        &mut self,
        scheme: &str,
        resolver: impl UriResolver + 'static,
    ) -> Option<Arc<dyn UriResolver>> {
        self.resolvers
            .insert(scheme.to_ascii_lowercase(), Arc::new(resolver))
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.resolvers.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }

    pub fn resolve_uri(&self, uri: &str) -> Result<(Arc<dyn StorageFactory>, Kwargs), DbError> {
        let parsed = Url::parse(uri)
            .map_err(|e| DbError::config(format!("invalid storage URI '{uri}': {e}")))?;
        let resolver = self.resolvers.get(parsed.scheme()).ok_or_else(|| {
            DbError::config(format!(
                "no resolver for scheme '{}' (known: {})",
                parsed.scheme(),
                self.schemes().join(", ")
            ))
        })?;
        resolver.resolve(&parsed)
    }
}

impl Default for UriRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for UriRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UriRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}

/// Resolve `config` to a storage factory and database options.
pub fn resolve(
    config: &StorageConfig,
    registry: &UriRegistry,
) -> Result<(Arc<dyn StorageFactory>, DatabaseOptions), DbError> {
    let (factory, kwargs) = match config {
        StorageConfig::Uri(uri) => registry.resolve_uri(uri)?,
        StorageConfig::Factory { factory, kwargs } => (Arc::clone(factory), kwargs.clone()),
        StorageConfig::Bare(factory) => (Arc::clone(factory), Kwargs::new()),
    };
    Ok((factory, DatabaseOptions::from_kwargs(&kwargs)?))
}

/// Build a database from the `COFFER_STORAGE` setting.
///
/// Fails with [`DbError::Configuration`] when the setting is absent. Errors
/// from the storage factory are returned unchanged.
pub fn create_database(
    config: Option<&StorageConfig>,
    registry: &UriRegistry,
) -> Result<Database, DbError> {
    let config = config
        .ok_or_else(|| DbError::config(format!("{STORAGE_CONFIG_KEY} is not configured")))?;
    let (factory, options) = resolve(config, registry)?;
    let storage = factory.create()?;
    info!(
        database = %options.database_name,
        storage = storage.name(),
        shape = config.shape(),
        "Storage resolved"
    );
    Ok(Database::new(storage, options))
}
