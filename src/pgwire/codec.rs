//! Deterministic encode/decode of the Postgres message framing: an
//! optional one-byte tag, a four-byte big-endian length that covers itself
//! plus the payload (but not the tag), then the payload.
//!
//! This layer is pure; it never touches a socket. Building a message cannot
//! fail because callers compose them from already-validated data. Reads
//! from an [`InputMessage`] fail with [`Error::Truncated`] when they would
//! run past the end of the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::pgwire::types::FrontendTag;

/// A message being composed for the server.
#[derive(Debug, Clone)]
pub struct OutputMessage {
    tag: Option<u8>,
    buf: BytesMut,
}

impl OutputMessage {
    /// A regular tagged message.
    pub fn new(tag: FrontendTag) -> OutputMessage {
        OutputMessage {
            tag: Some(tag.byte()),
            buf: BytesMut::new(),
        }
    }

    /// A startup-family message, which carries no tag byte.
    pub fn startup() -> OutputMessage {
        OutputMessage {
            tag: None,
            buf: BytesMut::new(),
        }
    }

    pub fn tag(&self) -> Option<u8> {
        self.tag
    }

    pub fn write_i16(&mut self, v: i16) {
        self.buf.put_i16(v);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    pub fn write_byte(&mut self, b: u8) {
        self.buf.put_u8(b);
    }

    pub fn write_bytes(&mut self, b: &[u8]) {
        self.buf.put_slice(b);
    }

    /// Write a NUL-terminated string.
    pub fn write_str(&mut self, s: &str) {
        self.buf.put_slice(s.as_bytes());
        self.buf.put_u8(0);
    }

    /// Serialize the whole message, header included.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.buf.len() + 5);
        if let Some(tag) = self.tag {
            out.put_u8(tag);
        }
        out.put_i32(self.buf.len() as i32 + 4);
        out.put_slice(&self.buf);
        out.freeze()
    }
}

/// A message received from the server: its tag byte and a cursor over the
/// payload for sequential typed reads.
#[derive(Debug, Clone)]
pub struct InputMessage {
    tag: u8,
    buf: Bytes,
}

impl InputMessage {
    pub fn new(tag: u8, payload: Bytes) -> InputMessage {
        InputMessage { tag, buf: payload }
    }

    pub fn tag(&self) -> u8 {
        self.tag
    }

    fn check(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(Error::Truncated(format!(
                "{} needs {} bytes, {} remain",
                what,
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        self.check(2, "int16")?;
        Ok(self.buf.get_i16())
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.check(4, "int32")?;
        Ok(self.buf.get_i32())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.check(8, "int64")?;
        Ok(self.buf.get_i64())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.check(8, "uint64")?;
        Ok(self.buf.get_u64())
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        self.check(1, "byte")?;
        Ok(self.buf.get_u8())
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes> {
        self.check(n, "bytes")?;
        Ok(self.buf.copy_to_bytes(n))
    }

    /// Read a string up to the first NUL byte.
    pub fn read_str(&mut self) -> Result<String> {
        let pos = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::Truncated("unterminated string".to_string()))?;
        let s = String::from_utf8_lossy(&self.buf[..pos]).into_owned();
        self.buf.advance(pos + 1);
        Ok(s)
    }

    /// Everything that has not been read yet.
    pub fn read_remaining(&mut self) -> Bytes {
        self.buf.copy_to_bytes(self.buf.remaining())
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_tagged_message() {
        let mut m = OutputMessage::new(FrontendTag::Query);
        m.write_str("SELECT 1");
        let b = m.encode();
        assert_eq!(b[0], b'Q');
        // length covers itself plus the payload, not the tag
        assert_eq!(&b[1..5], &(4 + 9i32).to_be_bytes());
        assert_eq!(&b[5..13], b"SELECT 1");
        assert_eq!(b[13], 0);
    }

    #[test]
    fn encode_startup_has_no_tag() {
        let mut m = OutputMessage::startup();
        m.write_i32(196608);
        let b = m.encode();
        assert_eq!(b.len(), 8);
        assert_eq!(&b[0..4], &8i32.to_be_bytes());
        assert_eq!(&b[4..8], &196608i32.to_be_bytes());
    }

    #[test]
    fn roundtrip_all_field_kinds() {
        let mut m = OutputMessage::new(FrontendTag::CopyData);
        m.write_i16(-7);
        m.write_i32(123456);
        m.write_i64(-987654321);
        m.write_u64(0xdead_beef_cafe_f00d);
        m.write_byte(0x42);
        m.write_str("hello");
        m.write_bytes(b"raw");
        let encoded = m.encode();

        let mut input = InputMessage::new(encoded[0], Bytes::copy_from_slice(&encoded[5..]));
        assert_eq!(input.tag(), b'd');
        assert_eq!(input.read_i16().unwrap(), -7);
        assert_eq!(input.read_i32().unwrap(), 123456);
        assert_eq!(input.read_i64().unwrap(), -987654321);
        assert_eq!(input.read_u64().unwrap(), 0xdead_beef_cafe_f00d);
        assert_eq!(input.read_byte().unwrap(), 0x42);
        assert_eq!(input.read_str().unwrap(), "hello");
        assert_eq!(&input.read_remaining()[..], b"raw");
        assert_eq!(input.remaining(), 0);
    }

    #[test]
    fn reads_past_end_are_truncation_errors() {
        let mut input = InputMessage::new(b'D', Bytes::from_static(&[0, 1]));
        assert!(matches!(input.read_i32(), Err(Error::Truncated(_))));
        // the failed read consumed nothing
        assert_eq!(input.read_i16().unwrap(), 1);
        assert!(matches!(input.read_byte(), Err(Error::Truncated(_))));
    }

    #[test]
    fn unterminated_string_is_truncation() {
        let mut input = InputMessage::new(b'S', Bytes::from_static(b"no nul here"));
        assert!(matches!(input.read_str(), Err(Error::Truncated(_))));
    }

    #[test]
    fn big_endian_on_the_wire() {
        let mut m = OutputMessage::new(FrontendTag::Execute);
        m.write_i32(1);
        let b = m.encode();
        assert_eq!(&b[5..9], &[0, 0, 0, 1]);
    }
}
