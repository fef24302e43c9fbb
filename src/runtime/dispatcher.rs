//! Routes inbound messages to registered handlers on the worker pool.

use super::threadpool::ThreadPool;
use crate::codec::{self, Message, MessageType, ReturnCode, ServiceKey};
use crate::error::{Error, Result};
use crate::logging::{Diagnostic, DiagnosticSink};
use crate::transport::SomeIpTransport;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

/// Handles requests, notifications or unsolicited responses for one
/// (service, instance, method/event).
pub trait MessageHandler: Send + Sync {
    /// For a `Request`, a returned payload is sent back as the response.
    /// The return value is ignored for every other message type.
    fn handle(&self, message: &Message, source: SocketAddr) -> Option<Bytes>;
}

impl<F> MessageHandler for F
where
    F: Fn(&Message, SocketAddr) -> Option<Bytes> + Send + Sync,
{
    fn handle(&self, message: &Message, source: SocketAddr) -> Option<Bytes> {
        self(message, source)
    }
}

type HandlerTable = RwLock<HashMap<(ServiceKey, u16), Arc<dyn MessageHandler>>>;

pub struct Dispatcher {
    handlers: HandlerTable,
    event_handlers: HandlerTable,
    pool: ThreadPool,
    transport: Arc<dyn SomeIpTransport>,
    sink: Arc<dyn DiagnosticSink>,
}

impl Dispatcher {
    /// `transport` is used to send responses back to requesters.
    pub fn new(
        worker_pool_size: usize,
        queue_bound: usize,
        transport: Arc<dyn SomeIpTransport>,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Result<Self> {
        Ok(Dispatcher {
            handlers: RwLock::new(HashMap::new()),
            event_handlers: RwLock::new(HashMap::new()),
            pool: ThreadPool::new(worker_pool_size, queue_bound)?,
            transport,
            sink,
        })
    }

    /// Register the handler for a method. Replaces (and returns) any
    /// handler registered for the same method before.
    pub fn register_handler(
        &self,
        key: ServiceKey,
        method_id: u16,
        handler: Arc<dyn MessageHandler>,
    ) -> Option<Arc<dyn MessageHandler>> {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((key, method_id), handler)
    }

    pub fn unregister_handler(
        &self,
        key: ServiceKey,
        method_id: u16,
    ) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner).remove(&(key, method_id))
    }

    /// Register the handler for notifications of `event_id`.
    pub fn register_event_handler(
        &self,
        key: ServiceKey,
        event_id: u16,
        handler: Arc<dyn MessageHandler>,
    ) -> Option<Arc<dyn MessageHandler>> {
        self.event_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((key, event_id), handler)
    }

    pub fn unregister_event_handler(
        &self,
        key: ServiceKey,
        event_id: u16,
    ) -> Option<Arc<dyn MessageHandler>> {
        self.event_handlers.write().unwrap_or_else(PoisonError::into_inner).remove(&(key, event_id))
    }

    pub fn has_handler(&self, key: ServiceKey, method_id: u16) -> bool {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).contains_key(&(key, method_id))
    }

    fn lookup(&self, message: &Message) -> Option<Arc<dyn MessageHandler>> {
        let table = match message.message_type() {
            MessageType::Notification => &self.event_handlers,
            _ => &self.handlers,
        };
        table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(message.key(), message.method_id()))
            .cloned()
    }

    /// Queue `message` for its handler.
    ///
    /// Messages from one source to one (service, instance, method) run in
    /// arrival order. Fails with `NoHandler` or `QueueFull`; both are also
    /// reported to the diagnostic sink.
    pub fn dispatch(&self, message: Message, source: SocketAddr) -> Result<()> {
        let key = message.key();
        let method_id = message.method_id();

        let Some(handler) = self.lookup(&message) else {
            self.sink.report(Diagnostic::NoHandler { key, method_id, source: Some(source) });
            if message.message_type() == MessageType::Request {
                self.reject_unknown(&message, source);
            }
            return Err(Error::NoHandler { key, method_id });
        };

        let transport = self.transport.clone();
        let sink = self.sink.clone();
        let job = move || {
            let reply = handler.handle(&message, source);
            if message.message_type() != MessageType::Request {
                return;
            }
            if let Some(payload) = reply {
                let response = Message::response_to(&message, payload);
                if let Err(e) = transport.send(&codec::encode(&response), source) {
                    let reason = e.to_string();
                    sink.report(Diagnostic::SendFailed { destination: source, reason });
                }
            }
        };

        self.pool.try_execute(job, Some((source, key, method_id))).inspect_err(|e| {
            if let Error::QueueFull { bound } = e {
                self.sink.report(Diagnostic::QueueFull { key, method_id, bound: *bound });
            }
        })
    }

    // Requesters get an error response instead of waiting for nothing.
    fn reject_unknown(&self, request: &Message, source: SocketAddr) {
        let service_known = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .any(|(key, _)| *key == request.key());
        let code = if service_known {
            ReturnCode::UnknownMethod
        } else {
            ReturnCode::UnknownService
        };
        let error = Message::error_to(request, code);
        if let Err(e) = self.transport.send(&codec::encode(&error), source) {
            self.sink.report(Diagnostic::SendFailed { destination: source, reason: e.to_string() });
        }
    }

    /// Stop accepting messages, finish queued and running handlers.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}
