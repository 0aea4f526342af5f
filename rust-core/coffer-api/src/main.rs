// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//! `coffer-api`
//!
//! Picks the storage URI from `COFFER_STORAGE` (default `memory://coffer`)
//! and binds Coffer to the host application. The connection pool itself is
//! built on the first request that touches the root mapping. `RUST_LOG`
//! sets the log filter.

use coffer_api::ApiConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ApiConfig::default().with_env_overrides();
    tracing::info!(
        storage = %config.storage,
        host = %config.host,
        port = config.port,
        "coffer-api starting"
    );

    coffer_api::serve(config).await?;
    Ok(())
}
