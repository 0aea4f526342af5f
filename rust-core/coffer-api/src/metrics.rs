// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! Prometheus metrics for request transactions and the connection pool.

use coffer_txn::TransactionState;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

use crate::ApiError;

/// Counters updated once per request, after teardown.
#[derive(Clone)]
pub struct ApiMetrics {
    registry: Registry,
    requests: IntCounter,
    commits: IntCounter,
    aborts: IntCounter,
    conflicts: IntCounter,
    connections_opened: IntCounter,
    open_connections: IntGauge,
}

impl ApiMetrics {
    pub fn new() -> Result<Self, ApiError> {
        let registry = Registry::new();

        let requests = IntCounter::new(
            "coffer_requests_total",
            "Requests that passed through a request scope",
        )?;
        let commits = IntCounter::new(
            "coffer_commits_total",
            "Request transactions committed at teardown",
        )?;
        let aborts = IntCounter::new(
            "coffer_aborts_total",
            "Request transactions aborted at teardown",
        )?;
        let conflicts = IntCounter::new(
            "coffer_conflicts_total",
            "Commits rejected because another request wrote first",
        )?;
        let connections_opened = IntCounter::new(
            "coffer_connections_opened_total",
            "Request connections opened",
        )?;
        let open_connections = IntGauge::new(
            "coffer_open_connections",
            "Connections currently leased from the pool",
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(commits.clone()))?;
        registry.register(Box::new(aborts.clone()))?;
        registry.register(Box::new(conflicts.clone()))?;
        registry.register(Box::new(connections_opened.clone()))?;
        registry.register(Box::new(open_connections.clone()))?;

        Ok(Self {
            registry,
            requests,
            commits,
            aborts,
            conflicts,
            connections_opened,
            open_connections,
        })
    }

    /// Record how a request's teardown resolved its transaction.
    ///
    /// `connected` is whether the request opened a connection at all.
    pub fn observe_teardown(&self, connected: bool, transaction: TransactionState, conflict: bool) {
        self.requests.inc();
        if !connected {
            return;
        }
        if conflict {
            self.conflicts.inc();
        }
        match transaction {
            TransactionState::Committed => self.commits.inc(),
            TransactionState::Aborted => self.aborts.inc(),
            _ => {}
        }
    }

    pub fn connection_opened(&self) {
        self.connections_opened.inc();
    }

    pub fn set_open_connections(&self, n: usize) {
        self.open_connections.set(i64::try_from(n).unwrap_or(i64::MAX));
    }

    pub fn commits(&self) -> u64 {
        self.commits.get()
    }

    pub fn aborts(&self) -> u64 {
        self.aborts.get()
    }

    pub fn conflicts(&self) -> u64 {
        self.conflicts.get()
    }

    /// Render every metric in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, ApiError> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| ApiError::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconnected_requests_count_only_as_requests() {
        let metrics = ApiMetrics::new().unwrap();
        metrics.observe_teardown(false, TransactionState::Idle, false);
        metrics.observe_teardown(true, TransactionState::Committed, false);
        metrics.observe_teardown(true, TransactionState::Aborted, true);
        assert_eq!(metrics.commits(), 1);
        assert_eq!(metrics.aborts(), 1);
        assert_eq!(metrics.conflicts(), 1);
        assert_eq!(metrics.requests.get(), 3);
    }

    #[test]
    fn test_render_lists_every_metric() {
        let metrics = ApiMetrics::new().unwrap();
        metrics.set_open_connections(2);
        let text = metrics.render().unwrap();
        for name in [
            "coffer_requests_total",
            "coffer_commits_total",
            "coffer_aborts_total",
            "coffer_conflicts_total",
            "coffer_connections_opened_total",
            "coffer_open_connections 2",
        ] {
            assert!(text.contains(name), "missing {name}");
        }
    }
}
