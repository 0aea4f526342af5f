// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! Transaction coordinator for Coffer.
//!
//! Every request context owns exactly one [`TransactionManager`]. Resources
//! that hold uncommitted changes (database connections) join the current
//! transaction as [`DataManager`]s; the manager then drives them through a
//! two-phase commit, or tells them to discard everything on abort.
//!
//! There is no ambient "current transaction": callers pass the manager
//! they own.

pub mod error;
pub mod manager;

pub use error::TransactionError;
pub use manager::{DataManager, TransactionId, TransactionInfo, TransactionManager, TransactionState};
