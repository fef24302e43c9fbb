use crate::codec::traits::ensure_remaining;
use crate::codec::{ServiceKey, SomeIpDeserialize, SomeIpSerialize};
use crate::error::CodecError;
use bytes::{Buf, BufMut};

/// SD entry types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    FindService,
    /// TTL 0 means StopOffer
    OfferService,
    /// TTL 0 means StopSubscribe
    SubscribeEventgroup,
    /// TTL 0 means Nack
    SubscribeEventgroupAck,
    Unknown(u8),
}

impl EntryType {
    pub fn is_eventgroup_entry(&self) -> bool {
        matches!(self, EntryType::SubscribeEventgroup | EntryType::SubscribeEventgroupAck)
    }
}

impl From<u8> for EntryType {
    fn from(v: u8) -> Self {
        match v {
            0x00 => EntryType::FindService,
            0x01 => EntryType::OfferService,
            0x06 => EntryType::SubscribeEventgroup,
            0x07 => EntryType::SubscribeEventgroupAck,
            other => EntryType::Unknown(other),
        }
    }
}

impl From<EntryType> for u8 {
    fn from(et: EntryType) -> u8 {
        match et {
            EntryType::FindService => 0x00,
            EntryType::OfferService => 0x01,
            EntryType::SubscribeEventgroup => 0x06,
            EntryType::SubscribeEventgroupAck => 0x07,
            EntryType::Unknown(other) => other,
        }
    }
}

/// Last four bytes of an entry: minor version for service entries,
/// counter + eventgroup for eventgroup entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryBody {
    Service { minor_version: u32 },
    Eventgroup { counter: u8, eventgroup_id: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdEntry {
    pub entry_type: EntryType,
    pub index_1: u8,
    pub index_2: u8,
    pub number_of_opts_1: u8,
    pub number_of_opts_2: u8,
    pub service_id: u16,
    pub instance_id: u16,
    pub major_version: u8,
    /// Seconds, 24 bits on the wire
    pub ttl: u32,
    pub body: EntryBody,
}

impl SdEntry {
    pub const LENGTH: usize = 16;
    pub const MAX_TTL: u32 = 0x00FF_FFFF;
    pub const ANY_INSTANCE: u16 = 0xFFFF;

    fn service(
        entry_type: EntryType,
        key: ServiceKey,
        major_version: u8,
        minor_version: u32,
        ttl: u32,
    ) -> Self {
        SdEntry {
            entry_type,
            index_1: 0,
            index_2: 0,
            number_of_opts_1: 0,
            number_of_opts_2: 0,
            service_id: key.service_id,
            instance_id: key.instance_id,
            major_version,
            ttl: ttl.min(Self::MAX_TTL),
            body: EntryBody::Service { minor_version },
        }
    }

    fn eventgroup(
        entry_type: EntryType,
        key: ServiceKey,
        major_version: u8,
        eventgroup_id: u16,
        ttl: u32,
    ) -> Self {
        SdEntry {
            body: EntryBody::Eventgroup { counter: 0, eventgroup_id },
            ..Self::service(entry_type, key, major_version, 0, ttl)
        }
    }

    pub fn find_service(key: ServiceKey, major_version: u8, ttl: u32) -> Self {
        Self::service(EntryType::FindService, key, major_version, 0xFFFF_FFFF, ttl)
    }

    pub fn offer_service(key: ServiceKey, major_version: u8, minor_version: u32, ttl: u32) -> Self {
        Self::service(EntryType::OfferService, key, major_version, minor_version, ttl)
    }

    pub fn stop_offer_service(key: ServiceKey, major_version: u8, minor_version: u32) -> Self {
        Self::offer_service(key, major_version, minor_version, 0)
    }

    pub fn subscribe(key: ServiceKey, major_version: u8, eventgroup_id: u16, ttl: u32) -> Self {
        Self::eventgroup(EntryType::SubscribeEventgroup, key, major_version, eventgroup_id, ttl)
    }

    pub fn stop_subscribe(key: ServiceKey, major_version: u8, eventgroup_id: u16) -> Self {
        Self::subscribe(key, major_version, eventgroup_id, 0)
    }

    pub fn subscribe_ack(key: ServiceKey, major_version: u8, eventgroup_id: u16, ttl: u32) -> Self {
        Self::eventgroup(EntryType::SubscribeEventgroupAck, key, major_version, eventgroup_id, ttl)
    }

    pub fn subscribe_nack(key: ServiceKey, major_version: u8, eventgroup_id: u16) -> Self {
        Self::subscribe_ack(key, major_version, eventgroup_id, 0)
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(self.service_id, self.instance_id)
    }

    /// StopOffer, StopSubscribe or Nack.
    pub fn is_stop(&self) -> bool {
        self.ttl == 0
    }

    pub fn eventgroup_id(&self) -> Option<u16> {
        match self.body {
            EntryBody::Eventgroup { eventgroup_id, .. } => Some(eventgroup_id),
            EntryBody::Service { .. } => None,
        }
    }

    /// Whether this entry addresses `key`, honouring the instance wildcard.
    pub fn matches(&self, key: ServiceKey) -> bool {
        self.service_id == key.service_id
            && (self.instance_id == Self::ANY_INSTANCE || self.instance_id == key.instance_id)
    }
}

impl SomeIpSerialize for SdEntry {
    fn serialize<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.entry_type.into());
        buf.put_u8(self.index_1);
        buf.put_u8(self.index_2);
        buf.put_u8((self.number_of_opts_1 << 4) | (self.number_of_opts_2 & 0x0F));
        buf.put_u16(self.service_id);
        buf.put_u16(self.instance_id);
        buf.put_u8(self.major_version);
        // TTL is 24 bits
        buf.put_slice(&self.ttl.to_be_bytes()[1..4]);
        match self.body {
            EntryBody::Service { minor_version } => buf.put_u32(minor_version),
            EntryBody::Eventgroup { counter, eventgroup_id } => {
                buf.put_u8(0x00);
                buf.put_u8(counter & 0x0F);
                buf.put_u16(eventgroup_id);
            }
        }
    }

    fn encoded_len(&self) -> usize {
        Self::LENGTH
    }
}

impl SomeIpDeserialize for SdEntry {
    fn deserialize<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        ensure_remaining(buf, Self::LENGTH)?;

        let entry_type = EntryType::from(buf.get_u8());
        let index_1 = buf.get_u8();
        let index_2 = buf.get_u8();
        let opts = buf.get_u8();
        let service_id = buf.get_u16();
        let instance_id = buf.get_u16();
        let major_version = buf.get_u8();
        let mut ttl_bytes = [0u8; 4];
        buf.copy_to_slice(&mut ttl_bytes[1..4]);
        let body = if entry_type.is_eventgroup_entry() {
            let _reserved = buf.get_u8();
            let counter = buf.get_u8() & 0x0F;
            EntryBody::Eventgroup { counter, eventgroup_id: buf.get_u16() }
        } else {
            EntryBody::Service { minor_version: buf.get_u32() }
        };

        Ok(SdEntry {
            entry_type,
            index_1,
            index_2,
            number_of_opts_1: opts >> 4,
            number_of_opts_2: opts & 0x0F,
            service_id,
            instance_id,
            major_version,
            ttl: u32::from_be_bytes(ttl_bytes),
            body,
        })
    }
}
