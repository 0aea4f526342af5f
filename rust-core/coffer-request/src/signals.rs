// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Connection lifecycle notifications.
//
// Listeners are plain callbacks registered per signal. Signals carry no
// payload. Callbacks run synchronously on the task that emits the signal,
// in registration order, and may register or remove listeners themselves.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Signal {
    /// A request opened its connection.
    ConnectionOpened,
    /// Teardown is about to resolve the transaction and close.
    ConnectionWillClose,
    /// The connection went back to the pool.
    ConnectionClosed,
}

impl Signal {
    pub fn name(self) -> &'static str {
        match self {
            Self::ConnectionOpened => "connection-opened",
            Self::ConnectionWillClose => "connection-will-close",
            Self::ConnectionClosed => "connection-closed",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn() + Send + Sync>;

/// Listener registry for the three connection signals.
#[derive(Default)]
pub struct Signals {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Signal, Listener)>>,
}

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, signal: Signal, listener: impl Fn() + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, signal, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn disconnect(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _, _)| *lid != id);
        listeners.len() != before
    }

    pub fn receivers(&self, signal: Signal) -> usize {
        self.listeners
            .read()
            .iter()
            .filter(|(_, s, _)| *s == signal)
            .count()
    }

    /// Call every listener of `signal`. Returns how many were called.
    pub fn send(&self, signal: Signal) -> usize {
        let targets: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .filter(|(_, s, _)| *s == signal)
            .map(|(_, _, l)| Arc::clone(l))
            .collect();
        for listener in &targets {
            listener();
        }
        targets.len()
    }
}

impl fmt::Debug for Signals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signals")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_send_reaches_only_matching_listeners() {
        let signals = Signals::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let l = Arc::clone(&log);
        signals.connect(Signal::ConnectionOpened, move || l.lock().push("opened-1"));
        let l = Arc::clone(&log);
        signals.connect(Signal::ConnectionOpened, move || l.lock().push("opened-2"));
        let l = Arc::clone(&log);
        signals.connect(Signal::ConnectionClosed, move || l.lock().push("closed"));

        assert_eq!(signals.send(Signal::ConnectionOpened), 2);
        assert_eq!(signals.send(Signal::ConnectionWillClose), 0);
        assert_eq!(*log.lock(), vec!["opened-1", "opened-2"]);
        assert_eq!(signals.receivers(Signal::ConnectionClosed), 1);
    }

    #[test]
    fn test_disconnect() {
        let signals = Signals::new();
        let id = signals.connect(Signal::ConnectionClosed, || {});
        assert!(signals.disconnect(id));
        assert!(!signals.disconnect(id));
        assert_eq!(signals.send(Signal::ConnectionClosed), 0);
    }

    #[test]
    fn test_listener_may_register_during_send() {
        let signals = Arc::new(Signals::new());
        let inner = Arc::clone(&signals);
        signals.connect(Signal::ConnectionOpened, move || {
            inner.connect(Signal::ConnectionClosed, || {});
        });
        signals.send(Signal::ConnectionOpened);
        assert_eq!(signals.receivers(Signal::ConnectionClosed), 1);
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(Signal::ConnectionWillClose.to_string(), "connection-will-close");
    }
}
