//! Application facade.
//!
//! An [`Application`] owns one set of runtime components (registry,
//! discovery, dispatcher, subscription manager, scheduler) and moves them
//! through `Created → Initialized → Running → Stopped`. Calls made before
//! the application runs are queued and replayed in order by `start()`.

use super::config::RuntimeConfig;
use super::dispatcher::{Dispatcher, MessageHandler};
use super::scheduler::{Scheduler, TaskId};
use crate::codec::{self, Message, ServiceKey, SessionIdManager};
use crate::error::{Error, Result};
use crate::logging::{Diagnostic, DiagnosticSink, LogSink, QueuedSink};
use crate::registry::{AvailabilityHandler, ServiceRegistry};
use crate::sd::{RemoteState, SdPacket, ServiceDiscovery};
use crate::subscription::{NotifyReport, SubscriptionManager};
use crate::transport::{is_timeout, SomeIpTransport, UdpTransport};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

const MAX_DATAGRAM: usize = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Initialized,
    Running,
    Stopped,
}

impl LifecycleState {
    pub fn name(self) -> &'static str {
        match self {
            LifecycleState::Created => "Created",
            LifecycleState::Initialized => "Initialized",
            LifecycleState::Running => "Running",
            LifecycleState::Stopped => "Stopped",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn invalid_transition(from: LifecycleState, operation: &'static str) -> Error {
    Error::InvalidLifecycleTransition { from: from.name(), operation }
}

// Work deferred until the application runs.
enum PendingOp {
    OfferService { key: ServiceKey, method_ids: Vec<u16> },
    StopOfferService(ServiceKey),
    OfferEvent { key: ServiceKey, event_id: u16, eventgroups: Vec<u16> },
    RequestService(ServiceKey),
    ReleaseService(ServiceKey),
    Subscribe { key: ServiceKey, eventgroup_id: u16 },
    Unsubscribe { key: ServiceKey, eventgroup_id: u16 },
    RegisterHandler { key: ServiceKey, method_id: u16, handler: Arc<dyn MessageHandler> },
    RegisterEventHandler { key: ServiceKey, event_id: u16, handler: Arc<dyn MessageHandler> },
    OnAvailability { key: ServiceKey, handler: Arc<dyn AvailabilityHandler> },
    Send { message: Message, reply: Option<oneshot::Sender<Message>> },
    Notify { key: ServiceKey, event_id: u16, payload: Bytes },
}

enum Route {
    Now(Arc<Runtime>, PendingOp),
    Queued,
}

struct Lifecycle {
    state: LifecycleState,
    pending: Vec<PendingOp>,
}

// (data, sd)
type TransportPair = (Arc<dyn SomeIpTransport>, Arc<dyn SomeIpTransport>);

// (key, method, client, session) of an outstanding request
type ResponseKey = (ServiceKey, u16, u16, u16);

fn response_key(message: &Message) -> ResponseKey {
    (message.key(), message.method_id(), message.client_id(), message.session_id())
}

/// The response to a request sent with [`Application::request`].
///
/// Dropping it abandons the request; a late response is then handed to the
/// dispatcher like any unsolicited one.
#[derive(Debug)]
pub struct PendingResponse {
    key: ServiceKey,
    method_id: u16,
    session_id: u16,
    rx: oneshot::Receiver<Message>,
}

impl PendingResponse {
    pub fn key(&self) -> ServiceKey {
        self.key
    }

    pub fn method_id(&self) -> u16 {
        self.method_id
    }

    pub fn session_id(&self) -> u16 {
        self.session_id
    }

    /// Block until the response arrives. Fails with `ShutDown` when the
    /// application stops first or the queued request could not be sent.
    ///
    /// Must not be called from inside an async runtime; use [`recv`](Self::recv) there.
    pub fn wait(self) -> Result<Message> {
        self.rx.blocking_recv().map_err(|_| Error::ShutDown)
    }

    /// Like [`wait`](Self::wait), giving up with `Timeout` after `timeout`.
    pub fn wait_timeout(self, timeout: Duration) -> Result<Message> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_time().build()?;
        runtime.block_on(self.recv_timeout(timeout))
    }

    pub async fn recv(self) -> Result<Message> {
        self.rx.await.map_err(|_| Error::ShutDown)
    }

    pub async fn recv_timeout(self, timeout: Duration) -> Result<Message> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::ShutDown),
            Err(_) => Err(Error::Timeout),
        }
    }
}

// Components created by init(). Receive threads share it through an Arc.
struct Runtime {
    name: String,
    data: Arc<dyn SomeIpTransport>,
    sd_transport: Arc<dyn SomeIpTransport>,
    data_endpoint: SocketAddr,
    registry: Arc<ServiceRegistry>,
    subscriptions: Arc<SubscriptionManager>,
    discovery: Mutex<ServiceDiscovery>,
    dispatcher: Dispatcher,
    scheduler: Scheduler,
    pending: Mutex<HashMap<ResponseKey, oneshot::Sender<Message>>>,
    receivers: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    sink: Arc<QueuedSink>,
}

impl Runtime {
    fn discovery(&self) -> MutexGuard<'_, ServiceDiscovery> {
        self.discovery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<ResponseKey, oneshot::Sender<Message>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, op: PendingOp) -> Result<()> {
        match op {
            PendingOp::OfferService { key, method_ids } => {
                // Keep events offered earlier through offer_event
                let events: Vec<(u16, u16)> = self
                    .registry
                    .record(key)
                    .map(|record| {
                        record
                            .offered_events
                            .iter()
                            .flat_map(|(&event_id, groups)| {
                                groups.iter().map(move |&eg| (event_id, eg))
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                self.registry.offer(key, method_ids, events)?;
                self.discovery().offer_service(key, Instant::now());
            }
            PendingOp::StopOfferService(key) => {
                self.discovery().stop_offer_service(key);
                self.registry.stop_offer(key);
            }
            PendingOp::OfferEvent { key, event_id, eventgroups } => {
                self.registry.offer_event(key, event_id, eventgroups);
            }
            PendingOp::RequestService(key) => self.discovery().request_service(key, Instant::now()),
            PendingOp::ReleaseService(key) => self.discovery().release_service(key),
            PendingOp::Subscribe { key, eventgroup_id } => {
                self.discovery().subscribe_eventgroup(key, eventgroup_id)
            }
            PendingOp::Unsubscribe { key, eventgroup_id } => {
                self.discovery().unsubscribe_eventgroup(key, eventgroup_id)
            }
            PendingOp::RegisterHandler { key, method_id, handler } => {
                if self.dispatcher.register_handler(key, method_id, handler).is_some() {
                    log::debug!(
                        target: "runtime",
                        "Replaced handler for {} method 0x{:04x}",
                        key, method_id
                    );
                }
            }
            PendingOp::RegisterEventHandler { key, event_id, handler } => {
                self.dispatcher.register_event_handler(key, event_id, handler);
            }
            PendingOp::OnAvailability { key, handler } => {
                self.registry.on_availability_change(key, handler)
            }
            PendingOp::Send { message, reply } => self.send_message(message, reply)?,
            PendingOp::Notify { key, event_id, payload } => {
                let report = self.subscriptions.notify(key, event_id, payload)?;
                log_failures(key, event_id, &report);
            }
        }
        Ok(())
    }

    // Remote endpoint from discovery, or our own for a locally offered key
    fn destination(&self, key: ServiceKey) -> Option<SocketAddr> {
        self.registry
            .remote_endpoint(key)
            .or_else(|| self.registry.is_offered_locally(key).then_some(self.data_endpoint))
    }

    fn send_message(
        &self,
        message: Message,
        reply: Option<oneshot::Sender<Message>>,
    ) -> Result<()> {
        let key = message.key();
        let destination = self.destination(key).ok_or(Error::NotAvailable(key))?;
        let waiter = response_key(&message);
        if let Some(tx) = reply {
            let mut pending = self.pending();
            pending.retain(|_, tx| !tx.is_closed());
            pending.insert(waiter, tx);
        }

        if let Err(e) = self.data.send(&codec::encode(&message), destination) {
            self.pending().remove(&waiter);
            self.sink.report(Diagnostic::SendFailed { destination, reason: e.to_string() });
            return Err(e.into());
        }
        Ok(())
    }

    fn receive_loop(&self, transport: &dyn SomeIpTransport, label: &str) {
        let mut buffer = vec![0u8; MAX_DATAGRAM];
        while self.running.load(Ordering::Acquire) {
            match transport.receive(&mut buffer) {
                // Nothing received after stop() began is handled
                Ok(_) if !self.running.load(Ordering::Acquire) => break,
                Ok((len, source)) => self.handle_datagram(&buffer[..len], source),
                Err(e) if is_timeout(&e) || e.kind() == ErrorKind::Interrupted => {}
                Err(e) if e.kind() == ErrorKind::NotConnected => {
                    log::warn!(target: "runtime", "[{}] {} socket closed: {}", self.name, label, e);
                    break;
                }
                Err(e) => log::error!(
                    target: "runtime",
                    "[{}] RX error on {} socket: {}",
                    self.name, label, e
                ),
            }
        }
        log::debug!(target: "runtime", "[{}] {} receive loop finished", self.name, label);
    }

    fn handle_datagram(&self, bytes: &[u8], source: SocketAddr) {
        let decoded = codec::decode_all(bytes);
        if let Some(e) = decoded.leftover {
            self.sink.report(Diagnostic::DecodeFailed { source, reason: e.to_string() });
        }

        for message in decoded.messages {
            if SdPacket::is_sd_message(&message) {
                let handled = self.discovery().handle_message(&message, source, Instant::now());
                if let Err(e) = handled {
                    self.sink.report(Diagnostic::DecodeFailed { source, reason: e.to_string() });
                }
                continue;
            }

            let message = if message.message_type().is_response() {
                match self.complete(message) {
                    Some(unclaimed) => unclaimed,
                    None => continue,
                }
            } else {
                message
            };

            // NoHandler and QueueFull already went to the sink
            if let Err(e) = self.dispatcher.dispatch(message, source) {
                log::debug!(
                    target: "runtime",
                    "[{}] Dropped message from {}: {}",
                    self.name, source, e
                );
            }
        }
    }

    // Hands a response to its waiter. Gives the message back if nobody waits.
    fn complete(&self, response: Message) -> Option<Message> {
        let waiter = self.pending().remove(&response_key(&response));
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
                None
            }
            None => Some(response),
        }
    }

    fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.scheduler.stop();
        self.discovery().shutdown();
        for key in self.registry.offered_keys() {
            self.registry.stop_offer(key);
        }

        let receivers =
            std::mem::take(&mut *self.receivers.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in receivers {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                log::error!(target: "runtime", "[{}] Receive thread panicked", self.name);
            }
        }

        self.dispatcher.shutdown();
        self.pending().clear();
        self.registry.shutdown();
        self.sink.shutdown();
    }
}

pub struct ApplicationBuilder {
    name: String,
    config: RuntimeConfig,
    transports: Option<TransportPair>,
    sink: Option<Arc<dyn DiagnosticSink>>,
}

impl ApplicationBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Use the given data and discovery transports instead of opening UDP
    /// sockets in `init()`. The discovery transport must already receive
    /// the configured multicast group.
    pub fn transports(
        mut self,
        data: Arc<dyn SomeIpTransport>,
        sd: Arc<dyn SomeIpTransport>,
    ) -> Self {
        self.transports = Some((data, sd));
        self
    }

    /// Diagnostics go to `sink` instead of the log.
    pub fn sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Arc<Application> {
        let (stop_tx, stop_rx) = mpsc::channel();
        let sink: Arc<dyn DiagnosticSink> = match self.sink {
            Some(sink) => sink,
            None => LogSink::new(),
        };
        Arc::new(Application {
            name: self.name,
            config: self.config,
            transports: self.transports,
            sink,
            lifecycle: Mutex::new(Lifecycle {
                state: LifecycleState::Created,
                pending: Vec::new(),
            }),
            runtime: OnceLock::new(),
            sessions: Mutex::new(SessionIdManager::new()),
            stop_signal: Mutex::new(Some(stop_tx)),
            stopped: Mutex::new(Some(stop_rx)),
        })
    }
}

pub struct Application {
    name: String,
    config: RuntimeConfig,
    transports: Option<TransportPair>,
    sink: Arc<dyn DiagnosticSink>,
    lifecycle: Mutex<Lifecycle>,
    runtime: OnceLock<Arc<Runtime>>,
    sessions: Mutex<SessionIdManager>,
    stop_signal: Mutex<Option<Sender<()>>>,
    stopped: Mutex<Option<Receiver<()>>>,
}

impl Application {
    pub fn builder(name: impl Into<String>) -> ApplicationBuilder {
        ApplicationBuilder {
            name: name.into(),
            config: RuntimeConfig::default(),
            transports: None,
            sink: None,
        }
    }

    pub fn new(name: impl Into<String>, config: RuntimeConfig) -> Arc<Self> {
        Self::builder(name).config(config).build()
    }

    /// Read the configuration from a JSON file.
    pub fn load(config_path: impl AsRef<Path>, name: impl Into<String>) -> Result<Arc<Self>> {
        Ok(Self::new(name, RuntimeConfig::load(config_path)?))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle().state
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn runtime(&self) -> Result<Arc<Runtime>> {
        self.runtime.get().cloned().ok_or(Error::ShutDown)
    }

    /// Open the transports and build the runtime components.
    pub fn init(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state != LifecycleState::Created {
            return Err(invalid_transition(lifecycle.state, "init"));
        }
        self.config.validate()?;

        let (data, sd_transport) = match &self.transports {
            Some((data, sd)) => (Arc::clone(data), Arc::clone(sd)),
            None => open_udp(&self.config)?,
        };
        data.set_receive_timeout(self.config.receive_timeout())?;
        sd_transport.set_receive_timeout(self.config.receive_timeout())?;
        let data_endpoint = advertised_endpoint(data.local_addr()?, self.config.unicast);

        let sink = QueuedSink::new(self.sink.clone());
        let registry = ServiceRegistry::new(sink.clone());
        let subscriptions = Arc::new(SubscriptionManager::new(
            registry.clone(),
            data.clone(),
            self.config.unavailable_policy,
            sink.clone(),
        ));
        let discovery = ServiceDiscovery::new(
            sd_transport.clone(),
            self.config.multicast_group(),
            data_endpoint,
            self.config.sd_timing(),
            registry.clone(),
            subscriptions.clone(),
            sink.clone(),
        );
        let dispatcher = Dispatcher::new(
            self.config.worker_pool_size,
            self.config.dispatch_queue_bound,
            data.clone(),
            sink.clone(),
        )?;
        let scheduler = Scheduler::new(&format!("{}-timer", self.name))?;

        let runtime = Arc::new(Runtime {
            name: self.name.clone(),
            data,
            sd_transport,
            data_endpoint,
            registry,
            subscriptions,
            discovery: Mutex::new(discovery),
            dispatcher,
            scheduler,
            pending: Mutex::new(HashMap::new()),
            receivers: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            sink,
        });
        // Only reachable once: the state check above guards it
        let _ = self.runtime.set(runtime);
        lifecycle.state = LifecycleState::Initialized;
        log::info!(
            target: "runtime",
            "[{}] Initialized, data endpoint {}",
            self.name, data_endpoint
        );
        Ok(())
    }

    /// Start the receive threads and discovery timer, replay queued calls,
    /// then block until [`stop`](Self::stop) is called from another thread.
    pub fn start(&self) -> Result<()> {
        let stopped = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state != LifecycleState::Initialized {
                return Err(invalid_transition(lifecycle.state, "start"));
            }
            let runtime = self.runtime()?;
            runtime.running.store(true, Ordering::Release);
            if let Err(e) = self.spawn_workers(&runtime) {
                runtime.running.store(false, Ordering::Release);
                return Err(e);
            }

            for op in std::mem::take(&mut lifecycle.pending) {
                if let Err(e) = runtime.apply(op) {
                    log::warn!(target: "runtime", "[{}] Queued operation failed: {}", self.name, e);
                }
            }
            lifecycle.state = LifecycleState::Running;
            self.stopped.lock().unwrap_or_else(PoisonError::into_inner).take()
        };

        log::info!(target: "runtime", "[{}] Running", self.name);
        if let Some(stopped) = stopped {
            let _ = stopped.recv();
        }
        log::info!(target: "runtime", "[{}] Stopped", self.name);
        Ok(())
    }

    fn spawn_workers(&self, runtime: &Arc<Runtime>) -> Result<()> {
        let transports = [("data", runtime.data.clone()), ("sd", runtime.sd_transport.clone())];
        for (label, transport) in transports {
            let rt = Arc::clone(runtime);
            let handle = thread::Builder::new()
                .name(format!("{}-{}-rx", self.name, label))
                .spawn(move || rt.receive_loop(transport.as_ref(), label))?;
            runtime.receivers.lock().unwrap_or_else(PoisonError::into_inner).push(handle);
        }

        let weak: Weak<Runtime> = Arc::downgrade(runtime);
        runtime.scheduler.schedule_repeating(Duration::ZERO, self.config.tick_interval(), move || {
            if let Some(rt) = weak.upgrade() {
                rt.discovery().poll(Instant::now());
            }
        })?;
        Ok(())
    }

    /// Stop-offer local services, cancel scheduled tasks, stop the receive
    /// threads and let running handlers finish. Returns once all of that is
    /// done; `start()` then returns too.
    pub fn stop(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state != LifecycleState::Running {
                return Err(invalid_transition(lifecycle.state, "stop"));
            }
            lifecycle.state = LifecycleState::Stopped;
        }
        log::info!(target: "runtime", "[{}] Stopping", self.name);

        if let Ok(runtime) = self.runtime() {
            runtime.shutdown();
        }
        if let Some(tx) = self.stop_signal.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = tx.send(());
        }
        Ok(())
    }

    fn route(&self, operation: &'static str, op: PendingOp) -> Result<Route> {
        let mut lifecycle = self.lifecycle();
        match lifecycle.state {
            LifecycleState::Running => Ok(Route::Now(self.runtime()?, op)),
            LifecycleState::Stopped => Err(invalid_transition(lifecycle.state, operation)),
            LifecycleState::Created | LifecycleState::Initialized => {
                log::debug!(target: "runtime", "[{}] Queued {} until start", self.name, operation);
                lifecycle.pending.push(op);
                Ok(Route::Queued)
            }
        }
    }

    fn submit(&self, operation: &'static str, op: PendingOp) -> Result<()> {
        match self.route(operation, op)? {
            Route::Now(runtime, op) => runtime.apply(op),
            Route::Queued => Ok(()),
        }
    }

    // Runtime of an initialized, not yet stopped application
    fn live_runtime(&self, operation: &'static str) -> Result<Arc<Runtime>> {
        match self.lifecycle().state {
            LifecycleState::Initialized | LifecycleState::Running => self.runtime(),
            state => Err(invalid_transition(state, operation)),
        }
    }

    /// Offer a service with the given methods and announce it. Events
    /// offered earlier through [`offer_event`](Self::offer_event) are kept.
    pub fn offer_service(
        &self,
        key: ServiceKey,
        method_ids: impl IntoIterator<Item = u16>,
    ) -> Result<()> {
        let method_ids = method_ids.into_iter().collect();
        self.submit("offer_service", PendingOp::OfferService { key, method_ids })
    }

    pub fn stop_offer_service(&self, key: ServiceKey) -> Result<()> {
        self.submit("stop_offer_service", PendingOp::StopOfferService(key))
    }

    /// Offer `event_id` of `key` under the given eventgroups.
    pub fn offer_event(
        &self,
        key: ServiceKey,
        event_id: u16,
        eventgroups: impl IntoIterator<Item = u16>,
    ) -> Result<()> {
        let eventgroups = eventgroups.into_iter().collect();
        self.submit("offer_event", PendingOp::OfferEvent { key, event_id, eventgroups })
    }

    /// Look for `key` in the network. Availability is reported to the
    /// handlers registered with [`on_availability`](Self::on_availability).
    pub fn request_service(&self, key: ServiceKey) -> Result<()> {
        self.submit("request_service", PendingOp::RequestService(key))
    }

    pub fn release_service(&self, key: ServiceKey) -> Result<()> {
        self.submit("release_service", PendingOp::ReleaseService(key))
    }

    /// Subscribe to an eventgroup of a requested service. The subscription
    /// is sent (and renewed) whenever the service is offered.
    pub fn subscribe(&self, key: ServiceKey, eventgroup_id: u16) -> Result<()> {
        self.submit("subscribe", PendingOp::Subscribe { key, eventgroup_id })
    }

    pub fn unsubscribe(&self, key: ServiceKey, eventgroup_id: u16) -> Result<()> {
        self.submit("unsubscribe", PendingOp::Unsubscribe { key, eventgroup_id })
    }

    /// Register the handler for requests to `method_id`. A later
    /// registration for the same method replaces it.
    pub fn register_handler(
        &self,
        key: ServiceKey,
        method_id: u16,
        handler: impl MessageHandler + 'static,
    ) -> Result<()> {
        let handler = Arc::new(handler);
        self.submit("register_handler", PendingOp::RegisterHandler { key, method_id, handler })
    }

    /// Register the handler for notifications of `event_id`.
    pub fn register_event_handler(
        &self,
        key: ServiceKey,
        event_id: u16,
        handler: impl MessageHandler + 'static,
    ) -> Result<()> {
        let handler = Arc::new(handler);
        let op = PendingOp::RegisterEventHandler { key, event_id, handler };
        self.submit("register_event_handler", op)
    }

    /// Called on the registry's notifier thread whenever `key` becomes
    /// available or goes away.
    pub fn on_availability(
        &self,
        key: ServiceKey,
        handler: impl AvailabilityHandler + 'static,
    ) -> Result<()> {
        let handler = Arc::new(handler);
        self.submit("on_availability", PendingOp::OnAvailability { key, handler })
    }

    /// Send a prebuilt message to the endpoint serving its key.
    pub fn send(&self, message: Message) -> Result<()> {
        self.submit("send", PendingOp::Send { message, reply: None })
    }

    /// Send a request stamped with our client ID and the next session ID.
    pub fn request(
        &self,
        key: ServiceKey,
        method_id: u16,
        payload: impl Into<Bytes>,
    ) -> Result<PendingResponse> {
        let session_id = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_session_id(key.service_id, method_id);
        let message = Message::request(key, method_id)
            .client_id(self.config.client_id)
            .session_id(session_id)
            .payload(payload)
            .build();

        let (tx, rx) = oneshot::channel();
        self.submit("request", PendingOp::Send { message, reply: Some(tx) })?;
        Ok(PendingResponse { key, method_id, session_id, rx })
    }

    /// Notify the subscribers of every eventgroup `event_id` is offered
    /// under. Before start the call is queued and the report says so.
    pub fn notify(
        &self,
        key: ServiceKey,
        event_id: u16,
        payload: impl Into<Bytes>,
    ) -> Result<NotifyReport> {
        let payload: Bytes = payload.into();
        match self.route("notify", PendingOp::Notify { key, event_id, payload: payload.clone() })? {
            Route::Now(runtime, _) => runtime.subscriptions.notify(key, event_id, payload),
            Route::Queued => Ok(NotifyReport { queued: true, ..Default::default() }),
        }
    }

    /// Notify `payload` now and then every `interval` until the task is
    /// cancelled or the application stops.
    pub fn notify_periodically(
        &self,
        key: ServiceKey,
        event_id: u16,
        payload: impl Into<Bytes>,
        interval: Duration,
    ) -> Result<TaskId> {
        let runtime = self.live_runtime("notify_periodically")?;
        let payload: Bytes = payload.into();
        let subscriptions = runtime.subscriptions.clone();
        runtime.scheduler.schedule_repeating(Duration::ZERO, interval, move || {
            match subscriptions.notify(key, event_id, payload.clone()) {
                Ok(report) => log_failures(key, event_id, &report),
                Err(e) => {
                    log::debug!(target: "runtime", "Periodic notify of {} skipped: {}", key, e)
                }
            }
        })
    }

    pub fn cancel_task(&self, id: TaskId) -> bool {
        self.runtime.get().is_some_and(|runtime| runtime.scheduler.cancel(id))
    }

    pub fn is_available(&self, key: ServiceKey) -> bool {
        self.runtime.get().is_some_and(|runtime| runtime.registry.is_available(key))
    }

    pub fn remote_state(&self, key: ServiceKey) -> RemoteState {
        self.runtime
            .get()
            .map_or(RemoteState::Unknown, |runtime| runtime.discovery().remote_state(key))
    }

    /// `None` until the server answered our subscription.
    pub fn subscription_acked(&self, key: ServiceKey, eventgroup_id: u16) -> Option<bool> {
        self.runtime
            .get()
            .and_then(|runtime| runtime.discovery().subscription_acked(key, eventgroup_id))
    }

    /// Endpoints subscribed to one of our eventgroups.
    pub fn subscribers(&self, key: ServiceKey, eventgroup_id: u16) -> Vec<SocketAddr> {
        self.runtime
            .get()
            .map(|runtime| runtime.subscriptions.subscribers(key, eventgroup_id))
            .unwrap_or_default()
    }

    /// Data endpoint advertised in our offers and subscriptions.
    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.runtime.get().map(|runtime| runtime.data_endpoint)
    }
}

impl Drop for Application {
    fn drop(&mut self) {
        if self.state() == LifecycleState::Running {
            let _ = self.stop();
        }
    }
}

fn log_failures(key: ServiceKey, event_id: u16, report: &NotifyReport) {
    for (subscriber, e) in &report.failures {
        log::warn!(
            target: "runtime",
            "Notify {} event 0x{:04x} to {} failed: {}",
            key, event_id, subscriber, e
        );
    }
}

// A wildcard bind address is not reachable by peers; advertise the
// configured unicast address with the bound port instead.
fn advertised_endpoint(bound: SocketAddr, unicast: IpAddr) -> SocketAddr {
    if bound.ip().is_unspecified() {
        SocketAddr::new(unicast, bound.port())
    } else {
        bound
    }
}

fn open_udp(config: &RuntimeConfig) -> Result<TransportPair> {
    let data = UdpTransport::new(config.unicast_endpoint())?;

    // Every SD participant on the host shares the multicast port
    let sd_bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.sd.port);
    let sd = UdpTransport::new_multicast(sd_bind)?;
    let interface = match config.unicast {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
    };
    sd.join_multicast_v4(&config.sd.multicast_ip, &interface)?;
    if let Err(e) = sd.set_multicast_if_v4(&interface) {
        log::warn!(target: "runtime", "Could not set multicast interface {}: {}", interface, e);
    }
    sd.set_multicast_loop_v4(true)?;
    log::info!(
        target: "runtime",
        "UDP data socket {}, SD group {} via {}",
        data.local_addr()?,
        config.multicast_group(),
        interface
    );
    Ok((Arc::new(data), Arc::new(sd)))
}
