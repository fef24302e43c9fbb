use crate::codec::traits::ensure_remaining;
use crate::codec::{Message, MessageType, ServiceKey, SomeIpDeserialize, SomeIpSerialize};
use crate::error::CodecError;
use crate::sd::entries::SdEntry;
use crate::sd::options::SdOption;
use bytes::{Buf, BufMut, Bytes};

/// SD messages are notifications on this service/method pair.
pub const SD_SERVICE_ID: u16 = 0xFFFF;
pub const SD_METHOD_ID: u16 = 0x8100;
pub const SD_KEY: ServiceKey = ServiceKey::new(SD_SERVICE_ID, 0x0000);

pub const FLAG_REBOOT: u8 = 0x80;
pub const FLAG_UNICAST: u8 = 0x40;

/// SD payload: flags, entries array and options array.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SdPacket {
    pub flags: u8,
    pub entries: Vec<SdEntry>,
    pub options: Vec<SdOption>,
}

impl SdPacket {
    pub fn new(flags: u8) -> Self {
        SdPacket { flags, ..Default::default() }
    }

    /// Append an entry whose first option run is `options`.
    pub fn push(&mut self, mut entry: SdEntry, options: Vec<SdOption>) {
        entry.index_1 = self.options.len() as u8;
        entry.number_of_opts_1 = options.len() as u8;
        entry.index_2 = 0;
        entry.number_of_opts_2 = 0;
        self.options.extend(options);
        self.entries.push(entry);
    }

    /// Options referenced by both option runs of `entry`. Runs pointing past
    /// the options array are ignored.
    pub fn options_for(&self, entry: &SdEntry) -> Vec<&SdOption> {
        let run = |index: u8, count: u8| {
            let start = index as usize;
            let end = start + count as usize;
            if count == 0 || end > self.options.len() {
                &self.options[0..0]
            } else {
                &self.options[start..end]
            }
        };
        run(entry.index_1, entry.number_of_opts_1)
            .iter()
            .chain(run(entry.index_2, entry.number_of_opts_2))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_sd_message(message: &Message) -> bool {
        message.service_id() == SD_SERVICE_ID && message.method_id() == SD_METHOD_ID
    }

    pub fn to_message(&self, session_id: u16) -> Message {
        let mut payload = Vec::with_capacity(self.encoded_len());
        self.serialize(&mut payload);
        Message::notification(SD_KEY, SD_METHOD_ID)
            .session_id(session_id)
            .payload(payload)
            .build()
    }

    pub fn from_message(message: &Message) -> Result<Self, CodecError> {
        if !Self::is_sd_message(message) || message.message_type() != MessageType::Notification {
            return Err(CodecError::malformed("not an SD message"));
        }
        let mut payload: Bytes = message.payload().clone();
        Self::deserialize(&mut payload)
    }
}

impl SomeIpSerialize for SdPacket {
    fn serialize<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.flags);
        buf.put_slice(&[0x00, 0x00, 0x00]);

        buf.put_u32((self.entries.len() * SdEntry::LENGTH) as u32);
        for entry in &self.entries {
            entry.serialize(buf);
        }

        let options_len: usize = self.options.iter().map(|o| o.encoded_len()).sum();
        buf.put_u32(options_len as u32);
        for option in &self.options {
            option.serialize(buf);
        }
    }

    fn encoded_len(&self) -> usize {
        let options: usize = self.options.iter().map(|o| o.encoded_len()).sum();
        12 + self.entries.len() * SdEntry::LENGTH + options
    }
}

impl SomeIpDeserialize for SdPacket {
    fn deserialize<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        ensure_remaining(buf, 8)?;
        let flags = buf.get_u8();
        buf.advance(3);

        let entries_len = buf.get_u32() as usize;
        if entries_len % SdEntry::LENGTH != 0 {
            return Err(CodecError::malformed(format!(
                "entries array length {entries_len} is not a multiple of 16"
            )));
        }
        ensure_remaining(buf, entries_len)?;
        let mut entries_buf = buf.copy_to_bytes(entries_len);
        let mut entries = Vec::with_capacity(entries_len / SdEntry::LENGTH);
        while entries_buf.has_remaining() {
            entries.push(SdEntry::deserialize(&mut entries_buf)?);
        }

        ensure_remaining(buf, 4)?;
        let options_len = buf.get_u32() as usize;
        ensure_remaining(buf, options_len)?;
        let mut options_buf = buf.copy_to_bytes(options_len);
        let mut options = Vec::new();
        while options_buf.has_remaining() {
            options.push(SdOption::deserialize(&mut options_buf)?);
        }

        Ok(SdPacket { flags, entries, options })
    }
}
