//! Discovery state machine.
//!
//! `ServiceDiscovery` owns the SD socket. It announces local offers, searches
//! for requested services, tracks remote offers per key and keeps eventgroup
//! subscriptions alive in both directions. It never blocks: the runtime feeds
//! it received SD messages through [`ServiceDiscovery::handle_message`] and
//! drives its timers through [`ServiceDiscovery::poll`]. Time is always
//! passed in, which keeps the schedule testable.

use super::entries::{EntryType, SdEntry};
use super::options::SdOption;
use super::packet::{FLAG_REBOOT, FLAG_UNICAST, SdPacket};
use crate::codec::{self, Message, ServiceKey};
use crate::error::CodecError;
use crate::logging::{Diagnostic, DiagnosticSink};
use crate::registry::ServiceRegistry;
use crate::subscription::SubscriptionManager;
use crate::transport::SomeIpTransport;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_MAJOR_VERSION: u8 = 0x01;
pub const DEFAULT_MINOR_VERSION: u32 = 0x0000_0000;

/// Discovery state of one remote service key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    Unknown,
    Offered,
    /// Offered and requested by this application
    Available,
    StopOffered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteEvent {
    OfferReceived { requested: bool },
    Requested,
    Released,
    StopOfferReceived,
    Expired,
}

impl RemoteState {
    pub fn on(self, event: RemoteEvent) -> RemoteState {
        use RemoteEvent::*;
        use RemoteState::*;
        match (self, event) {
            (Available, OfferReceived { .. }) => Available,
            (_, OfferReceived { requested: true }) => Available,
            (_, OfferReceived { requested: false }) => Offered,
            (Offered, Requested) => Available,
            (Available, Released) => Offered,
            (Offered | Available, StopOfferReceived | Expired) => StopOffered,
            (state, _) => state,
        }
    }
}

/// Announcement timing, taken from the runtime configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdTiming {
    pub repetition_base_delay: Duration,
    pub repetition_max: u32,
    pub announce_interval: Duration,
    pub liveness_timeout: Duration,
    /// Seconds
    pub offer_ttl: u32,
    /// Seconds
    pub subscribe_ttl: u32,
}

impl Default for SdTiming {
    fn default() -> Self {
        SdTiming {
            repetition_base_delay: Duration::from_millis(100),
            repetition_max: 3,
            announce_interval: Duration::from_millis(1000),
            liveness_timeout: Duration::from_millis(5000),
            offer_ttl: 3,
            subscribe_ttl: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Repetition,
    Main,
}

/// Send-now, then doubling delays, then the cyclic interval.
#[derive(Debug, Clone)]
struct Schedule {
    phase: Phase,
    repetition_count: u32,
    next_transmission: Instant,
}

impl Schedule {
    fn started(now: Instant) -> Self {
        Schedule { phase: Phase::Repetition, repetition_count: 0, next_transmission: now }
    }

    fn is_due(&self, now: Instant) -> bool {
        now >= self.next_transmission
    }

    // Called after every transmission.
    fn advance(&mut self, now: Instant, timing: &SdTiming) {
        match self.phase {
            Phase::Repetition => {
                self.repetition_count += 1;
                if self.repetition_count > timing.repetition_max {
                    self.phase = Phase::Main;
                    self.next_transmission = now + timing.announce_interval;
                } else {
                    let delay = 2u32
                        .checked_pow(self.repetition_count - 1)
                        .and_then(|factor| timing.repetition_base_delay.checked_mul(factor))
                        .unwrap_or(timing.announce_interval);
                    self.next_transmission = now + delay;
                }
            }
            Phase::Main => self.next_transmission = now + timing.announce_interval,
        }
    }
}

#[derive(Debug, Clone)]
struct LocalOffer {
    major_version: u8,
    minor_version: u32,
    schedule: Schedule,
}

#[derive(Debug, Clone)]
pub struct RemoteService {
    pub state: RemoteState,
    /// Data endpoint from the offer's endpoint option
    pub endpoint: SocketAddr,
    /// Where the offer came from; subscriptions go here
    pub sd_endpoint: SocketAddr,
    pub major_version: u8,
    pub last_seen: Instant,
    pub deadline: Instant,
}

pub struct ServiceDiscovery {
    transport: Arc<dyn SomeIpTransport>,
    multicast_group: SocketAddr,
    data_endpoint: SocketAddr,
    timing: SdTiming,
    local_offers: BTreeMap<ServiceKey, LocalOffer>,
    requested: HashMap<ServiceKey, Schedule>,
    remote_services: HashMap<ServiceKey, RemoteService>,
    // (key, eventgroup) -> last ack outcome
    client_subscriptions: BTreeMap<(ServiceKey, u16), Option<bool>>,
    registry: Arc<ServiceRegistry>,
    subscriptions: Arc<SubscriptionManager>,
    sink: Arc<dyn DiagnosticSink>,
    session_id: u16,
    reboot: bool,
}

impl ServiceDiscovery {
    pub fn new(
        transport: Arc<dyn SomeIpTransport>,
        multicast_group: SocketAddr,
        data_endpoint: SocketAddr,
        timing: SdTiming,
        registry: Arc<ServiceRegistry>,
        subscriptions: Arc<SubscriptionManager>,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Self {
        ServiceDiscovery {
            transport,
            multicast_group,
            data_endpoint,
            timing,
            local_offers: BTreeMap::new(),
            requested: HashMap::new(),
            remote_services: HashMap::new(),
            client_subscriptions: BTreeMap::new(),
            registry,
            subscriptions,
            sink,
            session_id: 1,
            reboot: true,
        }
    }

    pub fn remote_state(&self, key: ServiceKey) -> RemoteState {
        self.remote_services.get(&key).map_or(RemoteState::Unknown, |r| r.state)
    }

    pub fn remote_service(&self, key: ServiceKey) -> Option<&RemoteService> {
        self.remote_services.get(&key)
    }

    pub fn is_offering(&self, key: ServiceKey) -> bool {
        self.local_offers.contains_key(&key)
    }

    /// `None` while no answer arrived, otherwise whether the server acked.
    pub fn subscription_acked(&self, key: ServiceKey, eventgroup_id: u16) -> Option<bool> {
        self.client_subscriptions.get(&(key, eventgroup_id)).copied().flatten()
    }

    /// Start announcing `key`. The first offer goes out right away.
    pub fn offer_service(&mut self, key: ServiceKey, now: Instant) {
        self.offer_service_version(key, DEFAULT_MAJOR_VERSION, DEFAULT_MINOR_VERSION, now);
    }

    pub fn offer_service_version(
        &mut self,
        key: ServiceKey,
        major_version: u8,
        minor_version: u32,
        now: Instant,
    ) {
        log::info!(target: "sd", "Offering service {}", key);
        let schedule = Schedule::started(now);
        self.local_offers.insert(key, LocalOffer { major_version, minor_version, schedule });
        self.announce(now);
    }

    /// Withdraw `key` with an immediate StopOffer.
    pub fn stop_offer_service(&mut self, key: ServiceKey) -> bool {
        let Some(offer) = self.local_offers.remove(&key) else {
            return false;
        };
        log::info!(target: "sd", "Stop offering service {}", key);
        let mut packet = SdPacket::new(0);
        packet.push(
            SdEntry::stop_offer_service(key, offer.major_version, offer.minor_version),
            vec![SdOption::udp_endpoint(self.data_endpoint)],
        );
        self.send(packet, self.multicast_group);
        true
    }

    /// Ask for `key`. An already offered key becomes available at once,
    /// an unknown one is searched with FindService.
    pub fn request_service(&mut self, key: ServiceKey, now: Instant) {
        if self.requested.contains_key(&key) {
            return;
        }
        self.requested.insert(key, Schedule::started(now));

        if let Some(remote) = self.remote_services.get_mut(&key) {
            remote.state = remote.state.on(RemoteEvent::Requested);
            if remote.state == RemoteState::Available {
                let (endpoint, sd_endpoint) = (remote.endpoint, remote.sd_endpoint);
                self.registry.set_remote(key, endpoint);
                self.send_subscriptions(key, sd_endpoint);
            }
        } else {
            self.announce(now);
        }
    }

    pub fn release_service(&mut self, key: ServiceKey) {
        self.requested.remove(&key);
        if let Some(remote) = self.remote_services.get_mut(&key) {
            let previous = remote.state;
            remote.state = remote.state.on(RemoteEvent::Released);
            if previous == RemoteState::Available {
                self.registry.clear_remote(key);
            }
        }
    }

    /// Subscribe to a remote eventgroup. Sent now if the service is
    /// available, otherwise as soon as it becomes available.
    pub fn subscribe_eventgroup(&mut self, key: ServiceKey, eventgroup_id: u16) {
        self.client_subscriptions.insert((key, eventgroup_id), None);
        if let Some(remote) = self.available(key) {
            let ttl = self.timing.subscribe_ttl;
            let mut packet = SdPacket::new(0);
            packet.push(
                SdEntry::subscribe(key, remote.major_version, eventgroup_id, ttl),
                vec![SdOption::udp_endpoint(self.data_endpoint)],
            );
            let destination = remote.sd_endpoint;
            self.send(packet, destination);
        }
    }

    pub fn unsubscribe_eventgroup(&mut self, key: ServiceKey, eventgroup_id: u16) {
        if self.client_subscriptions.remove(&(key, eventgroup_id)).is_none() {
            return;
        }
        if let Some(remote) = self.available(key) {
            let mut packet = SdPacket::new(0);
            packet.push(
                SdEntry::stop_subscribe(key, remote.major_version, eventgroup_id),
                vec![SdOption::udp_endpoint(self.data_endpoint)],
            );
            let destination = remote.sd_endpoint;
            self.send(packet, destination);
        }
    }

    fn available(&self, key: ServiceKey) -> Option<&RemoteService> {
        self.remote_services.get(&key).filter(|r| r.state == RemoteState::Available)
    }

    /// Run due announcements and finds, drop remote services whose refresh
    /// deadline passed and expire stale subscribers.
    pub fn poll(&mut self, now: Instant) {
        self.announce(now);

        let expired: Vec<ServiceKey> = self
            .remote_services
            .iter()
            .filter(|(_, remote)| now >= remote.deadline)
            .map(|(key, _)| *key)
            .collect();
        for key in expired {
            log::warn!(target: "sd", "Service {} missed its refresh deadline", key);
            self.drop_remote(key, RemoteEvent::Expired, now);
        }

        self.subscriptions.expire(now);
    }

    fn announce(&mut self, now: Instant) {
        let mut packet = SdPacket::new(0);
        let endpoint = SdOption::udp_endpoint(self.data_endpoint);
        let ttl = self.timing.offer_ttl;

        for (key, offer) in self.local_offers.iter_mut() {
            if offer.schedule.is_due(now) {
                packet.push(
                    SdEntry::offer_service(*key, offer.major_version, offer.minor_version, ttl),
                    vec![endpoint.clone()],
                );
                offer.schedule.advance(now, &self.timing);
            }
        }

        for (key, schedule) in self.requested.iter_mut() {
            if self.remote_services.contains_key(key) || !schedule.is_due(now) {
                continue;
            }
            packet.push(SdEntry::find_service(*key, DEFAULT_MAJOR_VERSION, ttl), vec![]);
            schedule.advance(now, &self.timing);
        }

        if !packet.is_empty() {
            self.send(packet, self.multicast_group);
        }
    }

    /// Process one received SD message. Replies (offers for finds, acks,
    /// subscriptions) go back to `source` in a single packet.
    pub fn handle_message(
        &mut self,
        message: &Message,
        source: SocketAddr,
        now: Instant,
    ) -> Result<(), CodecError> {
        let packet = SdPacket::from_message(message)?;
        let mut reply = SdPacket::new(0);

        for entry in &packet.entries {
            match entry.entry_type {
                EntryType::FindService => self.on_find(entry, &mut reply),
                EntryType::OfferService => self.on_offer(&packet, entry, source, now, &mut reply),
                EntryType::SubscribeEventgroup => {
                    self.on_subscribe(&packet, entry, source, &mut reply)
                }
                EntryType::SubscribeEventgroupAck => self.on_subscribe_ack(entry),
                EntryType::Unknown(entry_type) => {
                    log::debug!(
                        target: "sd",
                        "Ignoring SD entry type 0x{:02x} from {}",
                        entry_type, source
                    )
                }
            }
        }

        if !reply.is_empty() {
            self.send(reply, source);
        }
        Ok(())
    }

    fn on_find(&self, entry: &SdEntry, reply: &mut SdPacket) {
        let ttl = self.timing.offer_ttl;
        for (key, offer) in &self.local_offers {
            if entry.matches(*key) {
                reply.push(
                    SdEntry::offer_service(*key, offer.major_version, offer.minor_version, ttl),
                    vec![SdOption::udp_endpoint(self.data_endpoint)],
                );
            }
        }
    }

    fn on_offer(
        &mut self,
        packet: &SdPacket,
        entry: &SdEntry,
        source: SocketAddr,
        now: Instant,
        reply: &mut SdPacket,
    ) {
        let key = entry.key();
        if self.local_offers.contains_key(&key) {
            // Our own multicast, or a second provider of a key we offer
            log::debug!(target: "sd", "Ignoring offer of {} from {}: offered locally", key, source);
            return;
        }
        if entry.is_stop() {
            self.drop_remote(key, RemoteEvent::StopOfferReceived, now);
            return;
        }

        let endpoint = advertised(packet, entry).unwrap_or(source);
        let lifetime = self.timing.liveness_timeout.min(Duration::from_secs(u64::from(entry.ttl)));
        let requested = self.requested.contains_key(&key);

        let remote = self.remote_services.entry(key).or_insert_with(|| RemoteService {
            state: RemoteState::Unknown,
            endpoint,
            sd_endpoint: source,
            major_version: entry.major_version,
            last_seen: now,
            deadline: now,
        });
        let previous = remote.state;
        remote.state = previous.on(RemoteEvent::OfferReceived { requested });
        remote.endpoint = endpoint;
        remote.sd_endpoint = source;
        remote.major_version = entry.major_version;
        remote.last_seen = now;
        remote.deadline = now + lifetime;

        if previous == RemoteState::Unknown {
            log::info!(target: "sd", "Service {} offered at {}", key, endpoint);
        }
        if remote.state == RemoteState::Available {
            let major_version = remote.major_version;
            let ttl = self.timing.subscribe_ttl;
            self.registry.set_remote(key, endpoint);
            // Subscriptions are renewed with every offer
            for (sub_key, eventgroup_id) in self.subscriptions_of(key) {
                reply.push(
                    SdEntry::subscribe(sub_key, major_version, eventgroup_id, ttl),
                    vec![SdOption::udp_endpoint(self.data_endpoint)],
                );
            }
        }
    }

    fn on_subscribe(
        &mut self,
        packet: &SdPacket,
        entry: &SdEntry,
        source: SocketAddr,
        reply: &mut SdPacket,
    ) {
        let Some(eventgroup_id) = entry.eventgroup_id() else {
            return;
        };
        let key = entry.key();
        let subscriber = advertised(packet, entry).unwrap_or(source);

        if entry.is_stop() {
            self.subscriptions.unsubscribe(key, eventgroup_id, subscriber);
            return;
        }

        if self.registry.offers_eventgroup(key, eventgroup_id) {
            let ttl = (entry.ttl != SdEntry::MAX_TTL)
                .then(|| Duration::from_secs(u64::from(entry.ttl)));
            self.subscriptions.subscribe(key, eventgroup_id, subscriber, ttl);
            let ack = SdEntry::subscribe_ack(key, entry.major_version, eventgroup_id, entry.ttl);
            reply.push(ack, vec![]);
        } else {
            log::warn!(
                target: "sd",
                "Rejecting subscription of {} to {} eventgroup 0x{:04x}: not offered",
                subscriber, key, eventgroup_id
            );
            reply.push(SdEntry::subscribe_nack(key, entry.major_version, eventgroup_id), vec![]);
        }
    }

    fn on_subscribe_ack(&mut self, entry: &SdEntry) {
        let Some(eventgroup_id) = entry.eventgroup_id() else {
            return;
        };
        let key = entry.key();
        if let Some(acked) = self.client_subscriptions.get_mut(&(key, eventgroup_id)) {
            *acked = Some(!entry.is_stop());
            if entry.is_stop() {
                log::warn!(
                    target: "sd",
                    "Subscription to {} eventgroup 0x{:04x} was refused",
                    key, eventgroup_id
                );
            } else {
                log::debug!(
                    target: "sd",
                    "Subscription to {} eventgroup 0x{:04x} acknowledged",
                    key, eventgroup_id
                );
            }
        }
    }

    // StopOffered is transient: the key ends up Unknown and, if still
    // requested, is searched for again.
    fn drop_remote(&mut self, key: ServiceKey, event: RemoteEvent, now: Instant) {
        let Some(remote) = self.remote_services.remove(&key) else {
            return;
        };
        let was_available = remote.state == RemoteState::Available;
        let state = remote.state.on(event);
        log::info!(target: "sd", "Service {} {:?} ({:?})", key, state, event);

        if was_available {
            self.registry.clear_remote(key);
        }
        for ((_, _), acked) in self.client_subscriptions.range_mut((key, 0)..=(key, u16::MAX)) {
            *acked = None;
        }
        if let Some(schedule) = self.requested.get_mut(&key) {
            *schedule = Schedule::started(now);
        }
    }

    fn send_subscriptions(&mut self, key: ServiceKey, destination: SocketAddr) {
        let Some(remote) = self.available(key) else {
            return;
        };
        let (major_version, ttl) = (remote.major_version, self.timing.subscribe_ttl);
        let mut packet = SdPacket::new(0);
        for (sub_key, eventgroup_id) in self.subscriptions_of(key) {
            packet.push(
                SdEntry::subscribe(sub_key, major_version, eventgroup_id, ttl),
                vec![SdOption::udp_endpoint(self.data_endpoint)],
            );
        }
        if !packet.is_empty() {
            self.send(packet, destination);
        }
    }

    /// Withdraw every local offer and remote subscription.
    pub fn shutdown(&mut self) {
        let keys: Vec<ServiceKey> = self.local_offers.keys().copied().collect();
        for key in keys {
            self.stop_offer_service(key);
        }
        let subscriptions: Vec<(ServiceKey, u16)> =
            self.client_subscriptions.keys().copied().collect();
        for (key, eventgroup_id) in subscriptions {
            self.unsubscribe_eventgroup(key, eventgroup_id);
        }
    }

    // (key, eventgroup) pairs we subscribed to for `key`
    fn subscriptions_of(&self, key: ServiceKey) -> impl Iterator<Item = (ServiceKey, u16)> + '_ {
        self.client_subscriptions.range((key, 0)..=(key, u16::MAX)).map(|(group, _)| *group)
    }

    fn next_session_id(&mut self) -> u16 {
        let session_id = self.session_id;
        self.session_id = if session_id == 0xFFFF {
            self.reboot = false;
            1
        } else {
            session_id + 1
        };
        session_id
    }

    fn send(&mut self, mut packet: SdPacket, destination: SocketAddr) {
        packet.flags = FLAG_UNICAST | if self.reboot { FLAG_REBOOT } else { 0 };
        let session_id = self.next_session_id();
        let bytes = codec::encode(&packet.to_message(session_id));
        if let Err(e) = self.transport.send(&bytes, destination) {
            self.sink.report(Diagnostic::SendFailed { destination, reason: e.to_string() });
        }
    }
}

// Endpoint option referenced by `entry`, if any
fn advertised(packet: &SdPacket, entry: &SdEntry) -> Option<SocketAddr> {
    packet.options_for(entry).iter().find_map(|o| o.endpoint())
}
