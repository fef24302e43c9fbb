//! # Service Registry
//!
//! Tracks services offered by this application and services discovered on
//! remote peers, and tells interested parties when a service instance
//! becomes available or goes away.
//!
//! All state sits behind one lock. Availability callbacks never run under
//! that lock: changes are queued on a channel and a dedicated notifier
//! thread invokes the handlers in the order the changes happened.

use crate::codec::ServiceKey;
use crate::error::{Error, Result};
use crate::logging::{Diagnostic, DiagnosticSink};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

/// Receives availability changes for a service instance.
pub trait AvailabilityHandler: Send + Sync {
    fn on_availability(&self, key: ServiceKey, available: bool);
}

impl<F> AvailabilityHandler for F
where
    F: Fn(ServiceKey, bool) + Send + Sync,
{
    fn on_availability(&self, key: ServiceKey, available: bool) {
        self(key, available)
    }
}

/// A locally offered service instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub key: ServiceKey,
    pub available: bool,
    pub offered_methods: BTreeSet<u16>,
    /// event_id -> eventgroups the event is offered under
    pub offered_events: BTreeMap<u16, BTreeSet<u16>>,
}

impl ServiceRecord {
    fn new(key: ServiceKey) -> Self {
        ServiceRecord {
            key,
            available: false,
            offered_methods: BTreeSet::new(),
            offered_events: BTreeMap::new(),
        }
    }
}

struct Notice {
    handlers: Vec<Arc<dyn AvailabilityHandler>>,
    key: ServiceKey,
    available: bool,
}

#[derive(Default)]
struct RegistryState {
    local: HashMap<ServiceKey, ServiceRecord>,
    remote: HashMap<ServiceKey, SocketAddr>,
    handlers: HashMap<ServiceKey, Vec<Arc<dyn AvailabilityHandler>>>,
    // Last availability announced per key; suppresses duplicate events
    reported: HashMap<ServiceKey, bool>,
}

impl RegistryState {
    fn is_available(&self, key: &ServiceKey) -> bool {
        self.local.get(key).is_some_and(|r| r.available) || self.remote.contains_key(key)
    }
}

pub struct ServiceRegistry {
    state: Mutex<RegistryState>,
    notices: Mutex<Option<Sender<Notice>>>,
    notifier: Mutex<Option<JoinHandle<()>>>,
    sink: Arc<dyn DiagnosticSink>,
}

impl ServiceRegistry {
    pub fn new(sink: Arc<dyn DiagnosticSink>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<Notice>();
        let notifier = thread::Builder::new()
            .name("availability-notifier".into())
            .spawn(move || {
                for notice in rx {
                    for handler in &notice.handlers {
                        handler.on_availability(notice.key, notice.available);
                    }
                }
            });
        let notifier = match notifier {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::error!(target: "registry", "Failed to spawn availability notifier: {}", e);
                None
            }
        };

        Arc::new(ServiceRegistry {
            state: Mutex::new(RegistryState::default()),
            notices: Mutex::new(Some(tx)),
            notifier: Mutex::new(notifier),
            sink,
        })
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Offer (or re-offer) a local service. Replaces the method and event
    /// sets; emits an availability event only if the service was not
    /// available before. Returns whether the stored record changed.
    pub fn offer(
        &self,
        key: ServiceKey,
        method_ids: impl IntoIterator<Item = u16>,
        events: impl IntoIterator<Item = (u16, u16)>,
    ) -> Result<bool> {
        let mut state = self.state();
        if state.remote.contains_key(&key) {
            return Err(Error::DuplicateOffer(key));
        }

        let mut offered_events: BTreeMap<u16, BTreeSet<u16>> = BTreeMap::new();
        for (event_id, eventgroup_id) in events {
            offered_events.entry(event_id).or_default().insert(eventgroup_id);
        }
        let updated = ServiceRecord {
            key,
            available: true,
            offered_methods: method_ids.into_iter().collect(),
            offered_events,
        };

        let changed = state.local.get(&key) != Some(&updated);
        state.local.insert(key, updated);
        let announced = self.announce_if_changed(&mut state, key);
        drop(state);
        self.report(announced);
        Ok(changed)
    }

    /// Add one event to a service record, creating an unavailable record if
    /// the service has not been offered yet.
    pub fn offer_event(
        &self,
        key: ServiceKey,
        event_id: u16,
        eventgroups: impl IntoIterator<Item = u16>,
    ) {
        let mut state = self.state();
        let record = state.local.entry(key).or_insert_with(|| ServiceRecord::new(key));
        record.offered_events.entry(event_id).or_default().extend(eventgroups);
    }

    /// Withdraw a local offer. The record (and its events) is kept so that
    /// subscriptions survive until the service is offered again.
    pub fn stop_offer(&self, key: ServiceKey) -> bool {
        let mut state = self.state();
        let was_available = match state.local.get_mut(&key) {
            Some(record) if record.available => {
                record.available = false;
                true
            }
            _ => false,
        };
        let announced = self.announce_if_changed(&mut state, key);
        drop(state);
        self.report(announced);
        was_available
    }

    pub fn is_available(&self, key: ServiceKey) -> bool {
        self.state().is_available(&key)
    }

    /// Whether this application currently offers `key` itself.
    pub fn is_offered_locally(&self, key: ServiceKey) -> bool {
        self.state().local.get(&key).is_some_and(|r| r.available)
    }

    pub fn record(&self, key: ServiceKey) -> Option<ServiceRecord> {
        self.state().local.get(&key).cloned()
    }

    pub fn offered_keys(&self) -> Vec<ServiceKey> {
        let state = self.state();
        let mut keys: Vec<_> =
            state.local.values().filter(|r| r.available).map(|r| r.key).collect();
        keys.sort();
        keys
    }

    /// Eventgroups a locally offered event belongs to.
    pub fn eventgroups_of(&self, key: ServiceKey, event_id: u16) -> Option<BTreeSet<u16>> {
        self.state().local.get(&key)?.offered_events.get(&event_id).cloned()
    }

    pub fn offers_eventgroup(&self, key: ServiceKey, eventgroup_id: u16) -> bool {
        self.state().local.get(&key).is_some_and(|r| {
            r.available && r.offered_events.values().any(|groups| groups.contains(&eventgroup_id))
        })
    }

    /// Record a remote provider for `key`.
    pub fn set_remote(&self, key: ServiceKey, endpoint: SocketAddr) {
        let announced = {
            let mut state = self.state();
            state.remote.insert(key, endpoint);
            self.announce_if_changed(&mut state, key)
        };
        self.report(announced);
    }

    pub fn clear_remote(&self, key: ServiceKey) {
        let announced = {
            let mut state = self.state();
            if state.remote.remove(&key).is_none() {
                return;
            }
            self.announce_if_changed(&mut state, key)
        };
        self.report(announced);
    }

    pub fn remote_endpoint(&self, key: ServiceKey) -> Option<SocketAddr> {
        self.state().remote.get(&key).copied()
    }

    /// Register a handler for availability changes of `key`. If the service
    /// is already available the handler is told so right away.
    pub fn on_availability_change(&self, key: ServiceKey, handler: Arc<dyn AvailabilityHandler>) {
        let mut state = self.state();
        state.handlers.entry(key).or_default().push(handler.clone());
        if state.is_available(&key) {
            self.enqueue(Notice { handlers: vec![handler], key, available: true });
        }
    }

    // Called with the state lock held; only queues, never calls out. The
    // returned diagnostic goes to the sink once the lock is released.
    fn announce_if_changed(
        &self,
        state: &mut RegistryState,
        key: ServiceKey,
    ) -> Option<Diagnostic> {
        let available = state.is_available(&key);
        let previous = state.reported.insert(key, available).unwrap_or(false);
        if previous == available {
            return None;
        }
        let handlers = state.handlers.get(&key).cloned().unwrap_or_default();
        if !handlers.is_empty() {
            self.enqueue(Notice { handlers, key, available });
        }
        Some(Diagnostic::AvailabilityChanged { key, available })
    }

    fn report(&self, diagnostic: Option<Diagnostic>) {
        if let Some(diagnostic) = diagnostic {
            self.sink.report(diagnostic);
        }
    }

    fn enqueue(&self, notice: Notice) {
        let notices = self.notices.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = notices.as_ref() {
            let _ = tx.send(notice);
        }
    }

    /// Deliver pending notifications, then stop the notifier thread.
    pub fn shutdown(&self) {
        self.notices.lock().unwrap_or_else(PoisonError::into_inner).take();
        let handle = self.notifier.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for ServiceRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
