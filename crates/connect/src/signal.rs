// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Chain Contributors

// One-shot disconnect notification shared by every hop of a chain

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why an established chain stopped working
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// SSH protocol error reported by the transport
    Protocol(String),
    /// Primary shell channel reached EOF or was closed
    StreamClosed,
    /// Socket-level failure
    Socket(String),
    /// Server sent a disconnect message
    Remote(String),
    /// A forward listener died
    ForwardFailed { forward: String, message: String },
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Protocol(msg) => write!(f, "protocol error: {}", msg),
            DisconnectReason::StreamClosed => f.write_str("shell stream closed"),
            DisconnectReason::Socket(msg) => write!(f, "socket error: {}", msg),
            DisconnectReason::Remote(msg) => write!(f, "disconnected by server: {}", msg),
            DisconnectReason::ForwardFailed { forward, message } => {
                write!(f, "forward {} failed: {}", forward, message)
            }
        }
    }
}

/// Token returned by [`DisconnectSignal::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Box<dyn FnOnce(&DisconnectReason) + Send>;

struct SignalInner {
    fired: AtomicBool,
    muted: AtomicBool,
    reason: OnceLock<DisconnectReason>,
    listeners: Mutex<Vec<(SubscriptionId, Listener)>>,
    next_id: AtomicU64,
    lost: CancellationToken,
}

/// Fires at most once, however many sources report
#[derive(Clone)]
pub struct DisconnectSignal {
    inner: Arc<SignalInner>,
}

impl Default for DisconnectSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DisconnectSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisconnectSignal")
            .field("fired", &self.is_fired())
            .field("reason", &self.reason())
            .finish()
    }
}

impl DisconnectSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                fired: AtomicBool::new(false),
                muted: AtomicBool::new(false),
                reason: OnceLock::new(),
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                lost: CancellationToken::new(),
            }),
        }
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<(SubscriptionId, Listener)>> {
        // A panicking listener must not wedge the signal
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reporter tagged with the component that will use it
    pub fn reporter(&self, source: impl Into<String>) -> DisconnectReporter {
        DisconnectReporter {
            signal: self.clone(),
            source: source.into(),
        }
    }

    /// Record the first reason and notify listeners; later calls are ignored
    ///
    /// Returns true when this call notified listeners (first report, not muted).
    pub fn fire(&self, reason: DisconnectReason) -> bool {
        if self.inner.fired.swap(true, Ordering::SeqCst) {
            debug!("Duplicate disconnect report ignored: {}", reason);
            return false;
        }

        let _ = self.inner.reason.set(reason.clone());
        self.inner.lost.cancel();

        let listeners = std::mem::take(&mut *self.listeners());
        if self.inner.muted.load(Ordering::SeqCst) {
            return false;
        }
        for (_, listener) in listeners {
            listener(&reason);
        }
        true
    }

    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<DisconnectReason> {
        self.inner.reason.get().cloned()
    }

    /// Completes once the signal has fired
    pub async fn lost(&self) {
        self.inner.lost.cancelled().await
    }

    /// Register a listener; runs immediately if the signal already fired
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: FnOnce(&DisconnectReason) + Send + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        if self.inner.muted.load(Ordering::SeqCst) {
            return id;
        }

        let mut listeners = self.listeners();
        match self.inner.reason.get() {
            Some(reason) => {
                drop(listeners);
                listener(reason);
            }
            None => listeners.push((id, Box::new(listener))),
        }
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Drop every listener and ignore future subscriptions
    pub fn mute(&self) {
        self.inner.muted.store(true, Ordering::SeqCst);
        self.listeners().clear();
    }

    pub fn listener_count(&self) -> usize {
        self.listeners().len()
    }
}

/// Handed to connectors so a hop can report post-establishment failures
#[derive(Clone, Debug)]
pub struct DisconnectReporter {
    signal: DisconnectSignal,
    source: String,
}

impl DisconnectReporter {
    pub fn report(&self, reason: DisconnectReason) {
        if self.signal.fire(reason.clone()) {
            warn!("{}: {}", self.source, reason);
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Reporter for a sub-component of the same hop
    pub fn child(&self, component: &str) -> DisconnectReporter {
        DisconnectReporter {
            signal: self.signal.clone(),
            source: format!("{} {}", self.source, component),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_fires_once() {
        let signal = DisconnectSignal::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        signal.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let reporter = signal.reporter("hop 1");
        reporter.report(DisconnectReason::Socket("reset".to_string()));
        reporter.report(DisconnectReason::StreamClosed);
        signal.reporter("hop 2").report(DisconnectReason::Protocol("bad mac".to_string()));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            signal.reason(),
            Some(DisconnectReason::Socket("reset".to_string()))
        );
    }

    #[test]
    fn test_late_subscriber_called_immediately() {
        let signal = DisconnectSignal::new();
        signal.fire(DisconnectReason::StreamClosed);

        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();
        signal.subscribe(move |reason| {
            *slot.lock().unwrap() = Some(reason.clone());
        });
        assert_eq!(*seen.lock().unwrap(), Some(DisconnectReason::StreamClosed));
    }

    #[test]
    fn test_unsubscribe_and_mute() {
        let signal = DisconnectSignal::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let id = signal.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(signal.unsubscribe(id));
        assert!(!signal.unsubscribe(id));

        let counter = calls.clone();
        signal.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        signal.mute();
        assert_eq!(signal.listener_count(), 0);

        signal.fire(DisconnectReason::StreamClosed);
        let counter = calls.clone();
        signal.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(signal.is_fired());
    }

    #[tokio::test]
    async fn test_lost_completes_after_fire() {
        let signal = DisconnectSignal::new();
        let waiter = signal.clone();
        let task = tokio::spawn(async move { waiter.lost().await });
        signal.fire(DisconnectReason::Remote("bye".to_string()));
        task.await.unwrap();
    }
}
