// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Coffer Storage Engine Boundary
//
// Coffer keeps an application's object graph in a key-value engine that it
// does not own. This crate fixes the contract such an engine must satisfy
// and ships two engines that satisfy it, so a connection pool can be wired
// to either without knowing which one it got.
//
// # Modules
//
// - [`backend`]: `StorageBackend` and the `BatchOp` commit unit
// - [`error`]: `StorageError`
// - [`memory`]: the `memory://` engine
// - [`redb_backend`]: the single-file engine (feature `redb-backend`)
//
// # Example
//
// ```rust
// use coffer_storage::{BatchOp, InMemoryBackend, StorageBackend};
//
// # tokio_test::block_on(async {
// let engine = InMemoryBackend::new();
// engine
//     .apply_batch(&[BatchOp::put("root:answer", "42"), BatchOp::delete("root:stale")])
//     .await
//     .unwrap();
//
// assert_eq!(engine.get(b"root:answer").await.unwrap(), Some(b"42".to_vec()));
// # });
// ```

pub mod backend;
pub mod error;
pub mod memory;

#[cfg(feature = "redb-backend")]
pub mod redb_backend;

pub use backend::{BatchOp, StorageBackend};
pub use error::StorageError;
pub use memory::InMemoryBackend;

#[cfg(feature = "redb-backend")]
pub use redb_backend::RedbBackend;
