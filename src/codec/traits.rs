use crate::error::CodecError;
use bytes::{Buf, BufMut};

// Types with a fixed SOME/IP wire layout that write themselves into a buffer
pub trait SomeIpSerialize {
    fn serialize<B: BufMut>(&self, buf: &mut B);

    /// Exact number of bytes `serialize` writes.
    fn encoded_len(&self) -> usize;
}

// Types that parse themselves from the front of a buffer, advancing it
pub trait SomeIpDeserialize: Sized {
    fn deserialize<B: Buf>(buf: &mut B) -> Result<Self, CodecError>;
}

/// Fail with `Truncated` unless `buf` still holds `needed` bytes.
pub(crate) fn ensure_remaining<B: Buf>(buf: &B, needed: usize) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::Truncated {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}
