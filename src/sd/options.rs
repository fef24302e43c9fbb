use crate::codec::traits::ensure_remaining;
use crate::codec::{SomeIpDeserialize, SomeIpSerialize};
use crate::error::CodecError;
use bytes::{Buf, BufMut, Bytes};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub const PROTO_TCP: u8 = 0x06;
pub const PROTO_UDP: u8 = 0x11;

const TYPE_IPV4_ENDPOINT: u8 = 0x04;
const TYPE_IPV6_ENDPOINT: u8 = 0x06;
// Length field counts the bytes after the type byte
const IPV4_ENDPOINT_LEN: u16 = 0x0009;
const IPV6_ENDPOINT_LEN: u16 = 0x0015;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdOption {
    Ipv4Endpoint {
        address: Ipv4Addr,
        transport_proto: u8,
        port: u16,
    },
    Ipv6Endpoint {
        address: Ipv6Addr,
        transport_proto: u8,
        port: u16,
    },
    /// Kept verbatim so re-encoding is lossless
    Unknown { type_id: u8, data: Bytes },
}

impl SdOption {
    pub fn udp_endpoint(addr: SocketAddr) -> Self {
        let (transport_proto, port) = (PROTO_UDP, addr.port());
        match addr.ip() {
            IpAddr::V4(address) => SdOption::Ipv4Endpoint { address, transport_proto, port },
            IpAddr::V6(address) => SdOption::Ipv6Endpoint { address, transport_proto, port },
        }
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        match self {
            SdOption::Ipv4Endpoint { address, port, .. } => {
                Some(SocketAddr::new(IpAddr::V4(*address), *port))
            }
            SdOption::Ipv6Endpoint { address, port, .. } => {
                Some(SocketAddr::new(IpAddr::V6(*address), *port))
            }
            SdOption::Unknown { .. } => None,
        }
    }
}

impl SomeIpSerialize for SdOption {
    fn serialize<B: BufMut>(&self, buf: &mut B) {
        match self {
            SdOption::Ipv4Endpoint { address, transport_proto, port } => {
                // [Len:2][Type:1][Res:1][IPv4:4][Res:1][L4:1][Port:2]
                buf.put_u16(IPV4_ENDPOINT_LEN);
                buf.put_u8(TYPE_IPV4_ENDPOINT);
                buf.put_u8(0x00);
                buf.put_slice(&address.octets());
                buf.put_u8(0x00);
                buf.put_u8(*transport_proto);
                buf.put_u16(*port);
            }
            SdOption::Ipv6Endpoint { address, transport_proto, port } => {
                buf.put_u16(IPV6_ENDPOINT_LEN);
                buf.put_u8(TYPE_IPV6_ENDPOINT);
                buf.put_u8(0x00);
                buf.put_slice(&address.octets());
                buf.put_u8(0x00);
                buf.put_u8(*transport_proto);
                buf.put_u16(*port);
            }
            SdOption::Unknown { type_id, data } => {
                buf.put_u16(data.len() as u16);
                buf.put_u8(*type_id);
                buf.put_slice(data);
            }
        }
    }

    fn encoded_len(&self) -> usize {
        3 + match self {
            SdOption::Ipv4Endpoint { .. } => IPV4_ENDPOINT_LEN as usize,
            SdOption::Ipv6Endpoint { .. } => IPV6_ENDPOINT_LEN as usize,
            SdOption::Unknown { data, .. } => data.len(),
        }
    }
}

impl SomeIpDeserialize for SdOption {
    fn deserialize<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        ensure_remaining(buf, 3)?;
        let length = buf.get_u16() as usize;
        let type_id = buf.get_u8();
        ensure_remaining(buf, length)?;
        let mut data = buf.copy_to_bytes(length);

        match type_id {
            TYPE_IPV4_ENDPOINT if length >= IPV4_ENDPOINT_LEN as usize => {
                data.advance(1);
                let mut octets = [0u8; 4];
                data.copy_to_slice(&mut octets);
                data.advance(1);
                let transport_proto = data.get_u8();
                let port = data.get_u16();
                let address = Ipv4Addr::from(octets);
                Ok(SdOption::Ipv4Endpoint { address, transport_proto, port })
            }
            TYPE_IPV6_ENDPOINT if length >= IPV6_ENDPOINT_LEN as usize => {
                data.advance(1);
                let mut octets = [0u8; 16];
                data.copy_to_slice(&mut octets);
                data.advance(1);
                let transport_proto = data.get_u8();
                let port = data.get_u16();
                let address = Ipv6Addr::from(octets);
                Ok(SdOption::Ipv6Endpoint { address, transport_proto, port })
            }
            _ => Ok(SdOption::Unknown { type_id, data }),
        }
    }
}
