// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Pool-wide activity statistics.
//
// Every connection close appends one record with the loads and stores the
// connection performed during its lease. Records older than the history
// length are dropped on the next append. Open/close events are counted
// with atomics so readers never block writers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::connection::TransferCounts;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ActivityRecord {
    at: DateTime<Utc>,
    loads: u64,
    stores: u64,
}

/// Aggregated activity over one slice of a report window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub loads: u64,
    pub stores: u64,
    /// Connections closed within this interval.
    pub connections: u64,
}

/// Result of [`ActivityMonitor::activity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityReport {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub intervals: Vec<ActivityInterval>,
    pub connections_opened: u64,
    pub connections_closed: u64,
}

impl ActivityReport {
    pub fn total_loads(&self) -> u64 {
        self.intervals.iter().map(|i| i.loads).sum()
    }

    pub fn total_stores(&self) -> u64 {
        self.intervals.iter().map(|i| i.stores).sum()
    }
}

/// Tracks connection activity for one [`Database`](crate::Database).
#[derive(Debug)]
pub struct ActivityMonitor {
    history_length_secs: AtomicU64,
    log: Mutex<VecDeque<ActivityRecord>>,
    opened: AtomicU64,
    closed: AtomicU64,
}

impl ActivityMonitor {
    pub fn new(history_length: Duration) -> Self {
        Self {
            history_length_secs: AtomicU64::new(history_length.as_secs()),
            log: Mutex::new(VecDeque::new()),
            opened: AtomicU64::new(0),
            closed: AtomicU64::new(0),
        }
    }

    pub fn history_length(&self) -> Duration {
        Duration::from_secs(self.history_length_secs.load(Ordering::Relaxed))
    }

    /// Change the retention window. Takes effect on the next close.
    pub fn set_history_length(&self, history_length: Duration) {
        self.history_length_secs
            .store(history_length.as_secs(), Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a closed connection and what it transferred while leased.
    pub fn connection_closed(&self, counts: TransferCounts) {
        self.record(Utc::now(), counts);
    }

    pub fn connections_opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    pub fn connections_closed(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    /// Connections opened and not yet closed.
    pub fn active_connections(&self) -> u64 {
        self.connections_opened()
            .saturating_sub(self.connections_closed())
    }

    /// Number of records currently retained.
    pub fn record_count(&self) -> usize {
        self.log.lock().len()
    }

    fn record(&self, at: DateTime<Utc>, counts: TransferCounts) {
        self.closed.fetch_add(1, Ordering::Relaxed);
        let mut log = self.log.lock();
        log.push_back(ActivityRecord {
            at,
            loads: counts.loads,
            stores: counts.stores,
        });
        if let Some(cutoff) = self.cutoff(at) {
            while log.front().is_some_and(|r| r.at < cutoff) {
                log.pop_front();
            }
        }
    }

    fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let history = chrono::Duration::from_std(self.history_length()).ok()?;
        now.checked_sub_signed(history)
    }

    /// Summarize activity between `start` and `end` in `divisions` equal
    /// intervals.
    ///
    /// `start` defaults to the oldest moment still inside the history
    /// window and `end` defaults to now. A record exactly at `end` falls in
    /// the last interval.
    pub fn activity(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        divisions: usize,
    ) -> ActivityReport {
        let end = end.unwrap_or_else(Utc::now);
        let start = start
            .or_else(|| self.cutoff(end))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let divisions = divisions.max(1);
        let span_ms = (end - start).num_milliseconds().max(0);
        let step_ms = span_ms / divisions as i64;

        let mut intervals: Vec<ActivityInterval> = (0..divisions)
            .map(|i| {
                let lo = start + chrono::Duration::milliseconds(step_ms * i as i64);
                let hi = if i + 1 == divisions {
                    end
                } else {
                    start + chrono::Duration::milliseconds(step_ms * (i as i64 + 1))
                };
                ActivityInterval {
                    start: lo,
                    end: hi,
                    loads: 0,
                    stores: 0,
                    connections: 0,
                }
            })
            .collect();

        for record in self.log.lock().iter() {
            if record.at < start || record.at > end {
                continue;
            }
            let offset_ms = (record.at - start).num_milliseconds();
            let index = if step_ms == 0 {
                0
            } else {
                ((offset_ms / step_ms) as usize).min(divisions - 1)
            };
            let slot = &mut intervals[index];
            slot.loads += record.loads;
            slot.stores += record.stores;
            slot.connections += 1;
        }

        ActivityReport {
            start,
            end,
            intervals,
            connections_opened: self.connections_opened(),
            connections_closed: self.connections_closed(),
        }
    }
}

impl Default for ActivityMonitor {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}
