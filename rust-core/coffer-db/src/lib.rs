// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! Coffer object database layer.
//!
//! A [`Database`] wraps one storage engine and leases [`Connection`]s from
//! a small pool. Each connection buffers the changes of one transaction,
//! joins a [`coffer_txn::TransactionManager`] as a data manager, and
//! exposes the application's persistent [`RootMapping`].
//!
//! Databases are normally built from configuration through
//! [`resolver::create_database`], which accepts a URI, a factory with
//! keyword arguments, or a bare factory.

pub mod activity;
pub mod connection;
pub mod database;
pub mod error;
pub mod options;
pub mod resolver;
pub mod root;

pub use activity::{ActivityInterval, ActivityMonitor, ActivityReport};
pub use connection::{Connection, ConnectionId, TransferCounts};
pub use database::Database;
pub use error::{DbError, DbResult};
pub use options::{DatabaseOptions, Kwargs};
pub use resolver::{
    create_database, resolve, StorageConfig, StorageFactory, UriRegistry, UriResolver,
    STORAGE_CONFIG_KEY,
};
pub use root::RootMapping;
