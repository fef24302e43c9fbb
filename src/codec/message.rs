use super::header::{MessageType, ReturnCode, SomeIpHeader};
use crate::error::CodecError;
use bytes::Bytes;
use std::fmt;

/// Identifies one service instance within a routing domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    pub service_id: u16,
    pub instance_id: u16,
}

impl ServiceKey {
    pub const fn new(service_id: u16, instance_id: u16) -> Self {
        ServiceKey { service_id, instance_id }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:04x}.{:04x}]", self.service_id, self.instance_id)
    }
}

/// A complete message. Fields are fixed at construction; use
/// [`MessageBuilder`] or the correlated constructors to create one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    key: ServiceKey,
    method_id: u16,
    client_id: u16,
    session_id: u16,
    interface_version: u8,
    message_type: MessageType,
    return_code: ReturnCode,
    payload: Bytes,
}

impl Message {
    pub fn request(key: ServiceKey, method_id: u16) -> MessageBuilder {
        MessageBuilder::new(key, method_id, MessageType::Request)
    }

    pub fn request_no_return(key: ServiceKey, method_id: u16) -> MessageBuilder {
        MessageBuilder::new(key, method_id, MessageType::RequestNoReturn)
    }

    pub fn notification(key: ServiceKey, event_id: u16) -> MessageBuilder {
        MessageBuilder::new(key, event_id, MessageType::Notification)
    }

    /// Response carrying the request's client and session IDs.
    pub fn response_to(request: &Message, payload: impl Into<Bytes>) -> Message {
        Message {
            key: request.key,
            method_id: request.method_id,
            client_id: request.client_id,
            session_id: request.session_id,
            interface_version: request.interface_version,
            message_type: MessageType::Response,
            return_code: ReturnCode::Ok,
            payload: payload.into(),
        }
    }

    /// Error response with an empty payload.
    pub fn error_to(request: &Message, return_code: ReturnCode) -> Message {
        Message {
            message_type: MessageType::Error,
            return_code,
            payload: Bytes::new(),
            ..request.clone()
        }
    }

    pub fn key(&self) -> ServiceKey {
        self.key
    }

    pub fn service_id(&self) -> u16 {
        self.key.service_id
    }

    pub fn instance_id(&self) -> u16 {
        self.key.instance_id
    }

    pub fn method_id(&self) -> u16 {
        self.method_id
    }

    pub fn client_id(&self) -> u16 {
        self.client_id
    }

    pub fn session_id(&self) -> u16 {
        self.session_id
    }

    pub fn interface_version(&self) -> u8 {
        self.interface_version
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn return_code(&self) -> ReturnCode {
        self.return_code
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn header(&self) -> SomeIpHeader {
        SomeIpHeader {
            service_id: self.key.service_id,
            instance_id: self.key.instance_id,
            method_id: self.method_id,
            length: self.payload.len() as u32 + SomeIpHeader::LENGTH_OVERHEAD,
            client_id: self.client_id,
            session_id: self.session_id,
            protocol_version: SomeIpHeader::SOMEIP_PROTOCOL_VERSION,
            interface_version: self.interface_version,
            message_type: self.message_type,
            return_code: self.return_code,
        }
    }

    pub fn encoded_len(&self) -> usize {
        SomeIpHeader::HEADER_LENGTH + self.payload.len()
    }
}

/// Builder for messages that do not answer an earlier request.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    key: ServiceKey,
    method_id: u16,
    client_id: u16,
    session_id: u16,
    interface_version: u8,
    message_type: MessageType,
    return_code: ReturnCode,
    payload: Bytes,
}

impl MessageBuilder {
    pub fn new(key: ServiceKey, method_id: u16, message_type: MessageType) -> Self {
        MessageBuilder {
            key,
            method_id,
            client_id: 0,
            session_id: 0,
            interface_version: 0x01,
            message_type,
            return_code: ReturnCode::Ok,
            payload: Bytes::new(),
        }
    }

    pub fn client_id(mut self, client_id: u16) -> Self {
        self.client_id = client_id;
        self
    }

    pub fn session_id(mut self, session_id: u16) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn interface_version(mut self, version: u8) -> Self {
        self.interface_version = version;
        self
    }

    pub fn return_code(mut self, return_code: ReturnCode) -> Self {
        self.return_code = return_code;
        self
    }

    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn build(self) -> Message {
        Message {
            key: self.key,
            method_id: self.method_id,
            client_id: self.client_id,
            session_id: self.session_id,
            interface_version: self.interface_version,
            message_type: self.message_type,
            return_code: self.return_code,
            payload: self.payload,
        }
    }
}

/// Encode a message into a freshly allocated buffer of exactly the right size.
pub fn encode(message: &Message) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message.encoded_len());
    buf.extend_from_slice(&message.header().serialize());
    buf.extend_from_slice(&message.payload);
    buf
}

/// Decode one message from the front of `buffer`. Bytes past the declared
/// length are ignored.
pub fn decode(buffer: &[u8]) -> Result<Message, CodecError> {
    decode_prefix(buffer).map(|(message, _)| message)
}

/// Messages found in one datagram.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decoded {
    pub messages: Vec<Message>,
    /// Set when bytes after the last complete message could not be decoded.
    pub leftover: Option<CodecError>,
}

/// Decode every message packed back to back in `buffer`. Decoding stops at
/// the first malformed or partial message; the messages before it are kept.
pub fn decode_all(mut buffer: &[u8]) -> Decoded {
    let mut decoded = Decoded::default();
    while !buffer.is_empty() {
        match decode_prefix(buffer) {
            Ok((message, consumed)) => {
                decoded.messages.push(message);
                buffer = &buffer[consumed..];
            }
            Err(e) => {
                decoded.leftover = Some(e);
                break;
            }
        }
    }
    decoded
}

fn decode_prefix(buffer: &[u8]) -> Result<(Message, usize), CodecError> {
    let header = SomeIpHeader::deserialize(buffer)?;
    let total = SomeIpHeader::HEADER_LENGTH
        .checked_add(header.payload_length())
        .ok_or_else(|| CodecError::malformed("length field overflows"))?;

    if buffer.len() < total {
        return Err(CodecError::Truncated {
            needed: total,
            available: buffer.len(),
        });
    }

    let message = Message {
        key: ServiceKey::new(header.service_id, header.instance_id),
        method_id: header.method_id,
        client_id: header.client_id,
        session_id: header.session_id,
        interface_version: header.interface_version,
        message_type: header.message_type,
        return_code: header.return_code,
        payload: Bytes::copy_from_slice(&buffer[SomeIpHeader::HEADER_LENGTH..total]),
    };
    Ok((message, total))
}
