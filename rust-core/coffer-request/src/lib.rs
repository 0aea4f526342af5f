// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! Request-scoped transactional persistence.
//!
//! Bind [`Coffer`] to an [`Application`] once at startup. Every request then
//! gets a [`RequestContext`]. The first call to
//! [`RequestContext::data`] opens a pooled connection and begins a
//! transaction; teardown commits it when the request succeeded, or aborts
//! it when the request failed or the transaction was doomed.
//!
//! ```rust
//! use coffer_request::{Application, Coffer, RequestError};
//!
//! # tokio_test::block_on(async {
//! let mut app = Application::new("demo");
//! app.set_storage("memory://");
//! Coffer::with_app(&mut app).unwrap();
//! let app = std::sync::Arc::new(app);
//!
//! app.request(|ctx| Box::pin(async move {
//!     ctx.data().await?.insert("answer", &42)?;
//!     Ok::<_, RequestError>(())
//! }))
//! .await
//! .unwrap();
//!
//! let answer: Option<i64> = app
//!     .request(|ctx| Box::pin(async move { Ok::<_, RequestError>(ctx.data().await?.get("answer").await?) }))
//!     .await
//!     .unwrap();
//! assert_eq!(answer, Some(42));
//! # });
//! ```

pub mod app;
pub mod context;
pub mod error;
pub mod extension;
pub mod signals;

pub use app::{AppConfig, Application, ApplicationInfo, TeardownHook, EXTENSION_KEY};
pub use context::{RequestContext, TeardownState};
pub use error::RequestError;
pub use extension::{ApplicationState, Coffer};
pub use signals::{ListenerId, Signal, Signals};

pub use coffer_db::{RootMapping, StorageConfig, TransferCounts};
