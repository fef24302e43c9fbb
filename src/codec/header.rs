use crate::error::CodecError;

/// SOME/IP message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Request = 0x00,
    RequestNoReturn = 0x01,
    Notification = 0x02,
    Response = 0x80,
    Error = 0x81,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(MessageType::Request),
            0x01 => Some(MessageType::RequestNoReturn),
            0x02 => Some(MessageType::Notification),
            0x80 => Some(MessageType::Response),
            0x81 => Some(MessageType::Error),
            _ => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, MessageType::Request | MessageType::RequestNoReturn)
    }

    pub fn is_response(&self) -> bool {
        matches!(self, MessageType::Response | MessageType::Error)
    }
}

/// Standard AUTOSAR return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReturnCode {
    Ok = 0x00,
    NotOk = 0x01,
    UnknownService = 0x02,
    UnknownMethod = 0x03,
    NotReady = 0x04,
    NotReachable = 0x05,
    Timeout = 0x06,
    WrongProtocolVersion = 0x07,
    WrongInterfaceVersion = 0x08,
    MalformedMessage = 0x09,
    WrongMessageType = 0x0A,
}

impl ReturnCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        let code = match v {
            0x00 => ReturnCode::Ok,
            0x01 => ReturnCode::NotOk,
            0x02 => ReturnCode::UnknownService,
            0x03 => ReturnCode::UnknownMethod,
            0x04 => ReturnCode::NotReady,
            0x05 => ReturnCode::NotReachable,
            0x06 => ReturnCode::Timeout,
            0x07 => ReturnCode::WrongProtocolVersion,
            0x08 => ReturnCode::WrongInterfaceVersion,
            0x09 => ReturnCode::MalformedMessage,
            0x0A => ReturnCode::WrongMessageType,
            _ => return None,
        };
        Some(code)
    }
}

/// Fixed 18-byte header: the SOME/IP header with the instance ID carried
/// right after the service ID.
///
/// ```text
/// [service:2][instance:2][method:2][length:4][client:2][session:2]
/// [proto:1][iface:1][type:1][ret:1]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SomeIpHeader {
    pub service_id: u16,
    pub instance_id: u16,
    pub method_id: u16,
    pub length: u32,
    pub client_id: u16,
    pub session_id: u16,
    pub protocol_version: u8,
    pub interface_version: u8,
    pub message_type: MessageType,
    pub return_code: ReturnCode,
}

impl SomeIpHeader {
    pub const HEADER_LENGTH: usize = 18;
    pub const SOMEIP_PROTOCOL_VERSION: u8 = 0x01;
    /// Bytes covered by `length` that precede the payload (request ID + versions/type/code).
    pub const LENGTH_OVERHEAD: u32 = 8;

    pub fn payload_length(&self) -> usize {
        (self.length - Self::LENGTH_OVERHEAD) as usize
    }

    pub fn serialize(&self) -> [u8; Self::HEADER_LENGTH] {
        let mut buffer = [0u8; Self::HEADER_LENGTH];

        buffer[0..2].copy_from_slice(&self.service_id.to_be_bytes());
        buffer[2..4].copy_from_slice(&self.instance_id.to_be_bytes());
        buffer[4..6].copy_from_slice(&self.method_id.to_be_bytes());
        buffer[6..10].copy_from_slice(&self.length.to_be_bytes());
        buffer[10..12].copy_from_slice(&self.client_id.to_be_bytes());
        buffer[12..14].copy_from_slice(&self.session_id.to_be_bytes());
        buffer[14] = self.protocol_version;
        buffer[15] = self.interface_version;
        buffer[16] = self.message_type as u8;
        buffer[17] = self.return_code as u8;

        buffer
    }

    /// Parse and validate the fixed header. Does not look at the payload.
    pub fn deserialize(buffer: &[u8]) -> Result<Self, CodecError> {
        if buffer.len() < Self::HEADER_LENGTH {
            return Err(CodecError::Truncated {
                needed: Self::HEADER_LENGTH,
                available: buffer.len(),
            });
        }

        let protocol_version = buffer[14];
        if protocol_version != Self::SOMEIP_PROTOCOL_VERSION {
            return Err(CodecError::UnsupportedVersion(protocol_version));
        }

        let length = u32::from_be_bytes([buffer[6], buffer[7], buffer[8], buffer[9]]);
        if length < Self::LENGTH_OVERHEAD {
            return Err(CodecError::malformed(format!("length field {length} below minimum 8")));
        }

        let message_type = MessageType::from_u8(buffer[16])
            .ok_or_else(|| {
                CodecError::malformed(format!("unknown message type 0x{:02X}", buffer[16]))
            })?;
        let return_code = ReturnCode::from_u8(buffer[17])
            .ok_or_else(|| {
                CodecError::malformed(format!("unknown return code 0x{:02X}", buffer[17]))
            })?;

        Ok(SomeIpHeader {
            service_id: u16::from_be_bytes([buffer[0], buffer[1]]),
            instance_id: u16::from_be_bytes([buffer[2], buffer[3]]),
            method_id: u16::from_be_bytes([buffer[4], buffer[5]]),
            length,
            client_id: u16::from_be_bytes([buffer[10], buffer[11]]),
            session_id: u16::from_be_bytes([buffer[12], buffer[13]]),
            protocol_version,
            interface_version: buffer[15],
            message_type,
            return_code,
        })
    }
}
