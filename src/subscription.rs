//! # Subscription Manager
//!
//! Tracks which endpoints subscribed to which eventgroups of the services
//! this application offers, and fans notifications out to them.
//!
//! Fan-out is best effort: each subscriber gets its own send, failures are
//! collected in the [`NotifyReport`] and never stop delivery to the rest.

use crate::codec::{self, Message, ServiceKey, SessionIdManager};
use crate::error::{Error, Result};
use crate::logging::{Diagnostic, DiagnosticSink};
use crate::registry::ServiceRegistry;
use crate::transport::SomeIpTransport;
use bytes::Bytes;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// What `notify` does while the service is not offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailablePolicy {
    /// Return an empty report; subscriptions stay in place.
    #[default]
    Suppress,
    /// Fail with `Error::NotAvailable`.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub key: ServiceKey,
    pub eventgroup_id: u16,
    pub subscriber: SocketAddr,
    /// `None` for subscriptions that never time out.
    pub expires_at: Option<Instant>,
}

/// Outcome of one `notify` call.
#[derive(Debug, Default)]
pub struct NotifyReport {
    pub delivered: Vec<SocketAddr>,
    pub failures: Vec<(SocketAddr, Error)>,
    /// Set when nothing was sent because the service is unavailable.
    pub suppressed: bool,
    /// Set when the call was made before start and will run then.
    pub queued: bool,
}

impl NotifyReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

type GroupKey = (ServiceKey, u16);
// subscriber -> expiry
type Subscribers = HashMap<SocketAddr, Option<Instant>>;

pub struct SubscriptionManager {
    subscriptions: Mutex<HashMap<GroupKey, Subscribers>>,
    registry: Arc<ServiceRegistry>,
    transport: Arc<dyn SomeIpTransport>,
    sessions: Mutex<SessionIdManager>,
    policy: UnavailablePolicy,
    sink: Arc<dyn DiagnosticSink>,
}

impl SubscriptionManager {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        transport: Arc<dyn SomeIpTransport>,
        policy: UnavailablePolicy,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Self {
        SubscriptionManager {
            subscriptions: Mutex::new(HashMap::new()),
            registry,
            transport,
            sessions: Mutex::new(SessionIdManager::new()),
            policy,
            sink,
        }
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<GroupKey, Subscribers>> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add or renew a subscription. Returns `true` for a new subscriber.
    pub fn subscribe(
        &self,
        key: ServiceKey,
        eventgroup_id: u16,
        subscriber: SocketAddr,
        ttl: Option<Duration>,
    ) -> bool {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        let is_new = self
            .subscriptions()
            .entry((key, eventgroup_id))
            .or_default()
            .insert(subscriber, expires_at)
            .is_none();
        if is_new {
            self.sink.report(Diagnostic::Subscribed { key, eventgroup_id, subscriber });
        }
        is_new
    }

    pub fn unsubscribe(&self, key: ServiceKey, eventgroup_id: u16, subscriber: SocketAddr) -> bool {
        let removed = {
            let mut subs = self.subscriptions();
            let removed = subs
                .get_mut(&(key, eventgroup_id))
                .is_some_and(|group| group.remove(&subscriber).is_some());
            subs.retain(|_, group| !group.is_empty());
            removed
        };
        if removed {
            self.sink.report(Diagnostic::Unsubscribed { key, eventgroup_id, subscriber });
        }
        removed
    }

    pub fn subscribers(&self, key: ServiceKey, eventgroup_id: u16) -> Vec<SocketAddr> {
        let mut subscribers: Vec<_> = self
            .subscriptions()
            .get(&(key, eventgroup_id))
            .map(|group| group.keys().copied().collect())
            .unwrap_or_default();
        subscribers.sort();
        subscribers
    }

    pub fn all(&self) -> Vec<Subscription> {
        let mut all: Vec<_> = self
            .subscriptions()
            .iter()
            .flat_map(|(&(key, eventgroup_id), group)| {
                group.iter().map(move |(&subscriber, &expires_at)| Subscription {
                    key,
                    eventgroup_id,
                    subscriber,
                    expires_at,
                })
            })
            .collect();
        all.sort_by_key(|s| (s.key, s.eventgroup_id, s.subscriber));
        all
    }

    /// Send `payload` as event `event_id` to every subscriber of an
    /// eventgroup the event is offered under. Each subscriber receives one
    /// message even if it subscribed to several of those eventgroups.
    pub fn notify(
        &self,
        key: ServiceKey,
        event_id: u16,
        payload: impl Into<Bytes>,
    ) -> Result<NotifyReport> {
        if !self.registry.is_offered_locally(key) {
            return match self.policy {
                UnavailablePolicy::Suppress => {
                    Ok(NotifyReport { suppressed: true, ..Default::default() })
                }
                UnavailablePolicy::Reject => Err(Error::NotAvailable(key)),
            };
        }

        let Some(eventgroups) = self.registry.eventgroups_of(key, event_id) else {
            log::debug!(
                target: "subscription",
                "Event 0x{:04x} of {} is not offered",
                event_id, key
            );
            return Ok(NotifyReport::default());
        };

        let now = Instant::now();
        let targets: BTreeSet<SocketAddr> = {
            let subs = self.subscriptions();
            eventgroups
                .iter()
                .filter_map(|eg| subs.get(&(key, *eg)))
                .flat_map(|group| group.iter())
                .filter(|(_, expires_at)| expires_at.is_none_or(|t| t > now))
                .map(|(addr, _)| *addr)
                .collect()
        };

        let mut report = NotifyReport::default();
        if targets.is_empty() {
            return Ok(report);
        }

        let session_id = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_session_id(key.service_id, event_id);
        let message = Message::notification(key, event_id)
            .session_id(session_id)
            .payload(payload)
            .build();
        let bytes = codec::encode(&message);

        for subscriber in targets {
            match self.transport.send(&bytes, subscriber) {
                Ok(_) => report.delivered.push(subscriber),
                Err(e) => {
                    let reason = e.to_string();
                    self.sink.report(Diagnostic::SendFailed { destination: subscriber, reason });
                    report.failures.push((subscriber, Error::Io(e)));
                }
            }
        }
        Ok(report)
    }

    /// Drop subscriptions whose TTL has run out.
    pub fn expire(&self, now: Instant) -> Vec<Subscription> {
        let mut expired = Vec::new();
        {
            let mut subs = self.subscriptions();
            for (&(key, eventgroup_id), group) in subs.iter_mut() {
                group.retain(|&subscriber, &mut expires_at| {
                    let alive = expires_at.is_none_or(|t| t > now);
                    if !alive {
                        expired.push(Subscription { key, eventgroup_id, subscriber, expires_at });
                    }
                    alive
                });
            }
            subs.retain(|_, group| !group.is_empty());
        }
        for s in &expired {
            self.sink.report(Diagnostic::SubscriptionExpired {
                key: s.key,
                eventgroup_id: s.eventgroup_id,
                subscriber: s.subscriber,
            });
        }
        expired
    }
}
