//! Logging setup and the diagnostic sink.
//!
//! All components log through the `log` facade. Events that an operator may
//! want to count or alert on (unroutable messages, full queues, decode
//! failures, availability flips) are additionally reported as structured
//! [`Diagnostic`] values to a [`DiagnosticSink`].

use crate::codec::ServiceKey;
use std::net::SocketAddr;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

/// Install `env_logger` with `info` as the default filter. `RUST_LOG`
/// overrides it. Safe to call more than once.
pub fn init() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}

/// Structured diagnostic events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    NoHandler { key: ServiceKey, method_id: u16, source: Option<SocketAddr> },
    QueueFull { key: ServiceKey, method_id: u16, bound: usize },
    DecodeFailed { source: SocketAddr, reason: String },
    SendFailed { destination: SocketAddr, reason: String },
    AvailabilityChanged { key: ServiceKey, available: bool },
    Subscribed { key: ServiceKey, eventgroup_id: u16, subscriber: SocketAddr },
    Unsubscribed { key: ServiceKey, eventgroup_id: u16, subscriber: SocketAddr },
    SubscriptionExpired { key: ServiceKey, eventgroup_id: u16, subscriber: SocketAddr },
}

pub trait DiagnosticSink: Send + Sync {
    fn report(&self, diagnostic: Diagnostic);
}

/// Forwards diagnostics to the `log` facade.
pub struct LogSink;

impl LogSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl DiagnosticSink for LogSink {
    fn report(&self, diagnostic: Diagnostic) {
        match &diagnostic {
            Diagnostic::NoHandler { key, method_id, source } => log::warn!(
                target: "dispatcher",
                "No handler for {} method 0x{:04x} (from {:?})",
                key, method_id, source
            ),
            Diagnostic::QueueFull { key, method_id, bound } => log::warn!(
                target: "dispatcher",
                "Queue full (bound {}), dropped {} method 0x{:04x}",
                bound, key, method_id
            ),
            Diagnostic::DecodeFailed { source, reason } => {
                log::warn!(target: "runtime", "Dropped datagram from {}: {}", source, reason)
            }
            Diagnostic::SendFailed { destination, reason } => {
                log::error!(target: "runtime", "Send to {} failed: {}", destination, reason)
            }
            Diagnostic::AvailabilityChanged { key, available } => {
                let status = if *available { "available" } else { "NOT available" };
                log::info!(target: "registry", "Service {} is {}", key, status)
            }
            Diagnostic::Subscribed { key, eventgroup_id, subscriber } => log::info!(
                target: "subscription",
                "{} subscribed to {} eventgroup 0x{:04x}",
                subscriber, key, eventgroup_id
            ),
            Diagnostic::Unsubscribed { key, eventgroup_id, subscriber } => log::info!(
                target: "subscription",
                "{} unsubscribed from {} eventgroup 0x{:04x}",
                subscriber, key, eventgroup_id
            ),
            Diagnostic::SubscriptionExpired { key, eventgroup_id, subscriber } => log::info!(
                target: "subscription",
                "Subscription of {} to {} eventgroup 0x{:04x} expired",
                subscriber, key, eventgroup_id
            ),
        }
    }
}

/// Keeps every diagnostic in memory. Useful in tests and for embedding
/// applications that poll for problems.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<Diagnostic>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Diagnostic> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl DiagnosticSink for CollectingSink {
    fn report(&self, diagnostic: Diagnostic) {
        if let Ok(mut events) = self.events.lock() {
            events.push(diagnostic);
        }
    }
}

/// Hands diagnostics to another sink on a dedicated thread, in the order
/// they were reported. Components report while holding their locks; the
/// wrapped sink never runs under them and may call back into the runtime.
pub struct QueuedSink {
    inner: Arc<dyn DiagnosticSink>,
    queue: Mutex<Option<Sender<Diagnostic>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl QueuedSink {
    pub fn new(inner: Arc<dyn DiagnosticSink>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<Diagnostic>();
        let target = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name("diagnostics".into())
            .spawn(move || {
                for diagnostic in rx {
                    target.report(diagnostic);
                }
            });
        let (queue, worker) = match worker {
            Ok(handle) => (Some(tx), Some(handle)),
            Err(e) => {
                log::error!(target: "logging", "Failed to spawn diagnostics thread: {}", e);
                (None, None)
            }
        };
        Arc::new(QueuedSink { inner, queue: Mutex::new(queue), worker: Mutex::new(worker) })
    }

    /// Deliver what is queued, then stop the thread. Later reports go to
    /// the wrapped sink directly.
    pub fn shutdown(&self) {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).take();
        let handle = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl DiagnosticSink for QueuedSink {
    fn report(&self, diagnostic: Diagnostic) {
        let unsent = {
            let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            match queue.as_ref() {
                Some(tx) => tx.send(diagnostic).err().map(|e| e.0),
                None => Some(diagnostic),
            }
        };
        if let Some(diagnostic) = unsent {
            self.inner.report(diagnostic);
        }
    }
}

impl Drop for QueuedSink {
    fn drop(&mut self) {
        self.shutdown();
    }
}
