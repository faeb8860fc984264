//! Binary frame layout
//!
//! ```text
//! byte 0      magic 0x53 ('S')
//! byte 1      flags  [qos:2][has_ts:1][enc:1][cmp:1][version:3]
//! bytes 2-3   payload length, u16 big-endian (hard limit 65535)
//! bytes 4-11  timestamp, u64 big-endian microseconds (only if has_ts)
//! rest        payload
//! ```
//!
//! The version bits select the payload encoding: 0 = map-style
//! (MessagePack), 1 = tagged-binary.

use crate::{Error, QoS, Result, FRAME_MAGIC};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Header size without timestamp.
pub const HEADER_LEN: usize = 4;

/// Header size with timestamp.
pub const HEADER_LEN_TS: usize = 12;

/// Hard payload limit imposed by the 16-bit length field.
pub const MAX_PAYLOAD: usize = 65_535;

/// Payload encoding selector carried in the frame version bits.
pub const ENCODING_MAP: u8 = 0;
pub const ENCODING_BINARY: u8 = 1;

/// Decoded flags byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags {
    pub qos: QoS,
    pub has_timestamp: bool,
    pub encrypted: bool,
    pub compressed: bool,
    /// Payload encoding version, three bits.
    pub version: u8,
}

impl FrameFlags {
    pub fn to_byte(self) -> u8 {
        let mut b = (self.qos as u8) << 6;
        if self.has_timestamp {
            b |= 0x20;
        }
        if self.encrypted {
            b |= 0x10;
        }
        if self.compressed {
            b |= 0x08;
        }
        b | (self.version & 0x07)
    }

    pub fn from_byte(b: u8) -> Self {
        Self {
            qos: QoS::from_u8((b >> 6) & 0x03).unwrap_or(QoS::Fire),
            has_timestamp: b & 0x20 != 0,
            encrypted: b & 0x10 != 0,
            compressed: b & 0x08 != 0,
            version: b & 0x07,
        }
    }
}

/// One wire frame: flags, optional timestamp, payload bytes.
#[derive(Debug, Clone)]
pub struct Frame {
    pub flags: FrameFlags,
    pub timestamp: Option<u64>,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            flags: FrameFlags::default(),
            timestamp: None,
            payload: payload.into(),
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.flags.qos = qos;
        self
    }

    pub fn with_version(mut self, version: u8) -> Self {
        self.flags.version = version & 0x07;
        self
    }

    pub fn with_timestamp(mut self, micros: u64) -> Self {
        self.timestamp = Some(micros);
        self.flags.has_timestamp = true;
        self
    }

    /// Total encoded size.
    pub fn len(&self) -> usize {
        let header = if self.flags.has_timestamp {
            HEADER_LEN_TS
        } else {
            HEADER_LEN
        };
        header + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn encode(&self) -> Result<Bytes> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(Error::LengthOverflow(self.payload.len()));
        }
        let mut buf = BytesMut::with_capacity(self.len());
        buf.put_u8(FRAME_MAGIC);
        buf.put_u8(self.flags.to_byte());
        buf.put_u16(self.payload.len() as u16);
        if let Some(ts) = self.timestamp {
            buf.put_u64(ts);
        }
        buf.extend_from_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: impl Buf) -> Result<Self> {
        if buf.remaining() < HEADER_LEN {
            return Err(Error::Truncated {
                needed: HEADER_LEN,
                have: buf.remaining(),
            });
        }
        let magic = buf.get_u8();
        if magic != FRAME_MAGIC {
            return Err(Error::BadMagic(magic));
        }
        let flags = FrameFlags::from_byte(buf.get_u8());
        let payload_len = buf.get_u16() as usize;
        let body = if flags.has_timestamp { 8 } else { 0 } + payload_len;
        if buf.remaining() < body {
            return Err(Error::Truncated {
                needed: HEADER_LEN + body,
                have: HEADER_LEN + buf.remaining(),
            });
        }
        let timestamp = flags.has_timestamp.then(|| buf.get_u64());
        let payload = buf.copy_to_bytes(payload_len);
        Ok(Self {
            flags,
            timestamp,
            payload,
        })
    }

    /// Length of the complete frame at the start of `buf`, `Ok(None)` when
    /// more bytes are needed. Stream transports drive their re-framing
    /// loop off this.
    pub fn check_complete(buf: &[u8]) -> Result<Option<usize>> {
        if buf.is_empty() {
            return Ok(None);
        }
        if buf[0] != FRAME_MAGIC {
            return Err(Error::BadMagic(buf[0]));
        }
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let flags = FrameFlags::from_byte(buf[1]);
        let payload_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let total = if flags.has_timestamp {
            HEADER_LEN_TS
        } else {
            HEADER_LEN
        } + payload_len;
        Ok((buf.len() >= total).then_some(total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_with_timestamp() {
        let frame = Frame::new(&b"payload"[..])
            .with_qos(QoS::Commit)
            .with_version(ENCODING_BINARY)
            .with_timestamp(1_700_000_000_000_000);
        let wire = frame.encode().unwrap();
        let back = Frame::decode(&wire[..]).unwrap();
        assert_eq!(back.flags, frame.flags);
        assert_eq!(back.timestamp, Some(1_700_000_000_000_000));
        assert_eq!(&back.payload[..], b"payload");
    }

    #[test]
    fn flags_byte_layout() {
        let flags = FrameFlags {
            qos: QoS::Confirm,
            has_timestamp: true,
            encrypted: false,
            compressed: false,
            version: 1,
        };
        assert_eq!(flags.to_byte(), 0b0110_0001);
        assert_eq!(FrameFlags::from_byte(0b0110_0001), flags);
    }

    #[test]
    fn check_complete_reports_exact_length() {
        let wire = Frame::new(&b"abc"[..]).encode().unwrap();
        assert_eq!(Frame::check_complete(&wire).unwrap(), Some(wire.len()));
        assert_eq!(Frame::check_complete(&wire[..3]).unwrap(), None);
        assert_eq!(Frame::check_complete(&wire[..5]).unwrap(), None);
        assert_eq!(Frame::check_complete(&[]).unwrap(), None);
    }

    #[test]
    fn check_complete_rejects_magic() {
        assert!(matches!(
            Frame::check_complete(&[0x00, 0, 0, 0]),
            Err(Error::BadMagic(0x00))
        ));
    }

    #[test]
    fn oversize_payload_rejected() {
        let frame = Frame::new(vec![0u8; MAX_PAYLOAD + 1]);
        assert!(matches!(frame.encode(), Err(Error::LengthOverflow(_))));
    }
}
