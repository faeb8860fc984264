//! Payload codecs
//!
//! Two payload encodings share one frame format:
//!
//! - **Map-style** (frame version 0): a MessagePack map with named keys
//!   whose first entry is `type`. The original deployment format; must
//!   stay decodable indefinitely.
//! - **Tagged-binary** (frame version 1): first byte is the message-type
//!   code, followed by a deterministic field-order serialization with
//!   fixed widths (lengths u16, integers i64, floats f64, strings
//!   length-prefixed UTF-8). Roughly half the size of map-style for
//!   high-rate messages.
//!
//! Inbound payloads are auto-discriminated by their first byte:
//! MessagePack maps start at 0x80–0x8F (fixmap) or 0xDE/0xDF, which is
//! disjoint from every message-type code.

use crate::frame::{ENCODING_BINARY, ENCODING_MAP};
use crate::types::*;
use crate::{Error, Frame, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

/// Value type codes for the tagged-binary encoding.
pub mod val {
    pub const NULL: u8 = 0x00;
    pub const BOOL: u8 = 0x01;
    pub const I8: u8 = 0x02;
    pub const I16: u8 = 0x03;
    pub const I32: u8 = 0x04;
    pub const I64: u8 = 0x05;
    pub const F32: u8 = 0x06;
    pub const F64: u8 = 0x07;
    pub const STRING: u8 = 0x08;
    pub const BYTES: u8 = 0x09;
    pub const ARRAY: u8 = 0x0A;
    pub const MAP: u8 = 0x0B;
}

/// Which payload encoding to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// Legacy MessagePack map payload.
    Map,
    /// Compact tagged-binary payload. Preferred for new traffic.
    #[default]
    Binary,
}

impl Encoding {
    pub fn version_bits(self) -> u8 {
        match self {
            Encoding::Map => ENCODING_MAP,
            Encoding::Binary => ENCODING_BINARY,
        }
    }

    pub fn from_version_bits(bits: u8) -> Self {
        if bits == ENCODING_MAP {
            Encoding::Map
        } else {
            Encoding::Binary
        }
    }
}

/// Encode a message into a complete frame using the preferred encoding
/// and the message's default QoS.
pub fn encode(message: &Message) -> Result<Bytes> {
    encode_with(message, Encoding::Binary, None, None)
}

/// Encode with explicit encoding, QoS and frame timestamp.
pub fn encode_with(
    message: &Message,
    encoding: Encoding,
    qos: Option<QoS>,
    timestamp: Option<u64>,
) -> Result<Bytes> {
    let payload = encode_payload(message, encoding)?;
    let mut frame = Frame::new(payload)
        .with_qos(qos.unwrap_or_else(|| message.default_qos()))
        .with_version(encoding.version_bits());
    if let Some(ts) = timestamp {
        frame = frame.with_timestamp(ts);
    }
    frame.encode()
}

/// Decode a complete frame into its message.
pub fn decode(bytes: &[u8]) -> Result<(Message, Frame)> {
    let frame = Frame::decode(bytes)?;
    let message = decode_payload(&frame.payload)?;
    Ok((message, frame))
}

/// Encode just the payload bytes.
pub fn encode_payload(message: &Message, encoding: Encoding) -> Result<Bytes> {
    match encoding {
        Encoding::Map => Ok(Bytes::from(rmp_serde::to_vec_named(message)?)),
        Encoding::Binary => {
            let mut buf = BytesMut::with_capacity(64);
            write_message(&mut buf, message)?;
            Ok(buf.freeze())
        }
    }
}

/// Decode a payload, auto-detecting its encoding from the first byte.
pub fn decode_payload(bytes: &[u8]) -> Result<Message> {
    let first = *bytes.first().ok_or(Error::Truncated { needed: 1, have: 0 })?;
    if is_msgpack_map(first) {
        return Ok(rmp_serde::from_slice(bytes)?);
    }
    if MessageType::from_u8(first).is_none() {
        return Err(Error::UnknownKind(first));
    }
    let mut r = Reader::new(&bytes[1..]);
    let msg = read_message(first, &mut r)?;
    Ok(msg)
}

/// The encoding a payload arrived in, without decoding it.
pub fn detect(bytes: &[u8]) -> Option<Encoding> {
    let first = *bytes.first()?;
    if is_msgpack_map(first) {
        Some(Encoding::Map)
    } else if MessageType::from_u8(first).is_some() {
        Some(Encoding::Binary)
    } else {
        None
    }
}

fn is_msgpack_map(byte: u8) -> bool {
    (byte & 0xF0) == 0x80 || byte == 0xDE || byte == 0xDF
}

// ---------------------------------------------------------------------------
// tagged-binary writer
// ---------------------------------------------------------------------------

fn write_message(buf: &mut BytesMut, msg: &Message) -> Result<()> {
    buf.put_u8(msg.message_type() as u8);
    match msg {
        Message::Hello(m) => {
            buf.put_u8(m.version);
            buf.put_u8(if m.token.is_some() { 0x01 } else { 0 });
            write_str(buf, &m.name)?;
            write_str_list(buf, &m.features)?;
            if let Some(tok) = &m.token {
                write_str(buf, tok)?;
            }
        }
        Message::Welcome(m) => {
            buf.put_u8(m.version);
            buf.put_u64(m.time);
            write_str(buf, &m.session)?;
            write_str(buf, &m.name)?;
            write_str_list(buf, &m.features)?;
        }
        Message::Announce(m) => {
            write_str(buf, &m.namespace)?;
            buf.put_u16(m.signals.len() as u16);
            for s in &m.signals {
                write_signal_info(buf, s)?;
            }
            buf.put_u8(if m.meta.is_some() { 0x01 } else { 0 });
            if let Some(meta) = &m.meta {
                write_map(buf, meta)?;
            }
        }
        Message::Subscribe(m) => {
            buf.put_u32(m.id);
            write_str(buf, &m.pattern)?;
            buf.put_u8(kind_mask(&m.types));
            let o = m.options.clone().unwrap_or_default();
            let mut bits = 0u8;
            if o.max_rate.is_some() {
                bits |= 0x01;
            }
            if o.epsilon.is_some() {
                bits |= 0x02;
            }
            if o.history.is_some() {
                bits |= 0x04;
            }
            if o.window.is_some() {
                bits |= 0x08;
            }
            buf.put_u8(bits);
            if let Some(v) = o.max_rate {
                buf.put_u32(v);
            }
            if let Some(v) = o.epsilon {
                buf.put_f64(v);
            }
            if let Some(v) = o.history {
                buf.put_u32(v);
            }
            if let Some(v) = o.window {
                buf.put_u32(v);
            }
        }
        Message::Unsubscribe(m) => buf.put_u32(m.id),
        Message::Publish(m) => {
            let mut bits = 0u8;
            if m.value.is_some() {
                bits |= 0x01;
            }
            if m.payload.is_some() {
                bits |= 0x02;
            }
            if m.samples.is_some() {
                bits |= 0x04;
            }
            if m.timestamp.is_some() {
                bits |= 0x08;
            }
            if m.id.is_some() {
                bits |= 0x10;
            }
            if m.phase.is_some() {
                bits |= 0x20;
            }
            if m.rate.is_some() {
                bits |= 0x40;
            }
            if m.signal.is_some() {
                bits |= 0x80;
            }
            buf.put_u8(bits);
            write_str(buf, &m.address)?;
            if let Some(kind) = m.signal {
                buf.put_u8(kind.code());
            }
            if let Some(v) = &m.value {
                write_value(buf, v)?;
            }
            if let Some(v) = &m.payload {
                write_value(buf, v)?;
            }
            if let Some(samples) = &m.samples {
                if samples.len() > u16::MAX as usize {
                    return Err(Error::LengthOverflow(samples.len()));
                }
                buf.put_u16(samples.len() as u16);
                for s in samples {
                    buf.put_f64(*s);
                }
            }
            if let Some(ts) = m.timestamp {
                buf.put_u64(ts);
            }
            if let Some(id) = m.id {
                buf.put_u32(id);
            }
            if let Some(phase) = m.phase {
                buf.put_u8(phase.code());
            }
            if let Some(rate) = m.rate {
                buf.put_u32(rate);
            }
        }
        Message::Set(m) => {
            let mut bits = 0u8;
            if m.revision.is_some() {
                bits |= 0x01;
            }
            if m.lock {
                bits |= 0x02;
            }
            if m.unlock {
                bits |= 0x04;
            }
            buf.put_u8(bits);
            write_str(buf, &m.address)?;
            write_value(buf, &m.value)?;
            if let Some(rev) = m.revision {
                buf.put_u64(rev);
            }
        }
        Message::Get(m) => write_str(buf, &m.address)?,
        Message::Snapshot(m) => {
            buf.put_u16(m.params.len() as u16);
            for p in &m.params {
                write_str(buf, &p.address)?;
                write_value(buf, &p.value)?;
                buf.put_u64(p.revision);
                let mut bits = 0u8;
                if p.writer.is_some() {
                    bits |= 0x01;
                }
                if p.timestamp.is_some() {
                    bits |= 0x02;
                }
                buf.put_u8(bits);
                if let Some(w) = &p.writer {
                    write_str(buf, w)?;
                }
                if let Some(ts) = p.timestamp {
                    buf.put_u64(ts);
                }
            }
        }
        Message::Bundle(m) => {
            buf.put_u8(if m.timestamp.is_some() { 0x01 } else { 0 });
            if let Some(ts) = m.timestamp {
                buf.put_u64(ts);
            }
            buf.put_u16(m.messages.len() as u16);
            for inner in &m.messages {
                let mut inner_buf = BytesMut::with_capacity(48);
                write_message(&mut inner_buf, inner)?;
                if inner_buf.len() > u16::MAX as usize {
                    return Err(Error::LengthOverflow(inner_buf.len()));
                }
                buf.put_u16(inner_buf.len() as u16);
                buf.extend_from_slice(&inner_buf);
            }
        }
        Message::Sync(m) => {
            let mut bits = 0u8;
            if m.t2.is_some() {
                bits |= 0x01;
            }
            if m.t3.is_some() {
                bits |= 0x02;
            }
            buf.put_u8(bits);
            buf.put_u64(m.t1);
            if let Some(t) = m.t2 {
                buf.put_u64(t);
            }
            if let Some(t) = m.t3 {
                buf.put_u64(t);
            }
        }
        Message::Ping | Message::Pong => {}
        Message::Ack(m) => {
            let mut bits = 0u8;
            if m.address.is_some() {
                bits |= 0x01;
            }
            if m.revision.is_some() {
                bits |= 0x02;
            }
            if m.locked.is_some() {
                bits |= 0x04;
            }
            if m.holder.is_some() {
                bits |= 0x08;
            }
            if m.correlation_id.is_some() {
                bits |= 0x10;
            }
            buf.put_u8(bits);
            if let Some(a) = &m.address {
                write_str(buf, a)?;
            }
            if let Some(r) = m.revision {
                buf.put_u64(r);
            }
            if let Some(l) = m.locked {
                buf.put_u8(l as u8);
            }
            if let Some(h) = &m.holder {
                write_str(buf, h)?;
            }
            if let Some(c) = m.correlation_id {
                buf.put_u32(c);
            }
        }
        Message::ErrorMsg(m) => {
            buf.put_u16(m.code);
            write_str(buf, &m.message)?;
            let mut bits = 0u8;
            if m.address.is_some() {
                bits |= 0x01;
            }
            if m.correlation_id.is_some() {
                bits |= 0x02;
            }
            buf.put_u8(bits);
            if let Some(a) = &m.address {
                write_str(buf, a)?;
            }
            if let Some(c) = m.correlation_id {
                buf.put_u32(c);
            }
        }
        Message::Query(m) => write_str(buf, &m.pattern)?,
        Message::QueryResult(m) => {
            buf.put_u16(m.signals.len() as u16);
            for s in &m.signals {
                write_signal_info(buf, s)?;
            }
        }
    }
    Ok(())
}

fn write_signal_info(buf: &mut BytesMut, s: &SignalInfo) -> Result<()> {
    write_str(buf, &s.address)?;
    buf.put_u8(s.kind.code());
    buf.put_u8(if s.datatype.is_some() { 0x01 } else { 0 });
    if let Some(dt) = &s.datatype {
        write_str(buf, dt)?;
    }
    Ok(())
}

#[inline]
fn write_str(buf: &mut BytesMut, s: &str) -> Result<()> {
    if s.len() > u16::MAX as usize {
        return Err(Error::LengthOverflow(s.len()));
    }
    buf.put_u16(s.len() as u16);
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn write_str_list(buf: &mut BytesMut, items: &[String]) -> Result<()> {
    if items.len() > u16::MAX as usize {
        return Err(Error::LengthOverflow(items.len()));
    }
    buf.put_u16(items.len() as u16);
    for s in items {
        write_str(buf, s)?;
    }
    Ok(())
}

fn write_map(buf: &mut BytesMut, map: &BTreeMap<String, Value>) -> Result<()> {
    if map.len() > u16::MAX as usize {
        return Err(Error::LengthOverflow(map.len()));
    }
    buf.put_u16(map.len() as u16);
    for (k, v) in map {
        write_str(buf, k)?;
        write_value(buf, v)?;
    }
    Ok(())
}

/// Tagged value: one type-code byte, then the fixed-width data.
fn write_value(buf: &mut BytesMut, value: &Value) -> Result<()> {
    match value {
        Value::Null => buf.put_u8(val::NULL),
        Value::Bool(b) => {
            buf.put_u8(val::BOOL);
            buf.put_u8(*b as u8);
        }
        Value::Int(i) => {
            buf.put_u8(val::I64);
            buf.put_i64(*i);
        }
        Value::Float(f) => {
            buf.put_u8(val::F64);
            buf.put_f64(*f);
        }
        Value::String(s) => {
            buf.put_u8(val::STRING);
            write_str(buf, s)?;
        }
        Value::Bytes(b) => {
            if b.len() > u16::MAX as usize {
                return Err(Error::LengthOverflow(b.len()));
            }
            buf.put_u8(val::BYTES);
            buf.put_u16(b.len() as u16);
            buf.extend_from_slice(b);
        }
        Value::Array(items) => {
            if items.len() > u16::MAX as usize {
                return Err(Error::LengthOverflow(items.len()));
            }
            buf.put_u8(val::ARRAY);
            buf.put_u16(items.len() as u16);
            for item in items {
                write_value(buf, item)?;
            }
        }
        Value::Map(map) => {
            buf.put_u8(val::MAP);
            write_map(buf, map)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// tagged-binary reader
// ---------------------------------------------------------------------------

/// Bounds-checked cursor; every read fails with `Truncated` instead of
/// panicking on short input.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let have = self.buf.len() - self.pos;
        if have < n {
            return Err(Error::Truncated { needed: n, have });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(self.u64()? as i64)
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.u64()?))
    }

    fn str(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::Decode(e.to_string()))
    }

    fn str_list(&mut self) -> Result<Vec<String>> {
        let n = self.u16()? as usize;
        let mut out = Vec::with_capacity(n.min(64));
        for _ in 0..n {
            out.push(self.str()?);
        }
        Ok(out)
    }
}

fn read_message(type_code: u8, r: &mut Reader) -> Result<Message> {
    let mt = MessageType::from_u8(type_code).ok_or(Error::UnknownKind(type_code))?;
    Ok(match mt {
        MessageType::Hello => {
            let version = r.u8()?;
            let bits = r.u8()?;
            let name = r.str()?;
            let features = r.str_list()?;
            let token = (bits & 0x01 != 0).then(|| r.str()).transpose()?;
            Message::Hello(Hello {
                version,
                name,
                features,
                token,
            })
        }
        MessageType::Welcome => {
            let version = r.u8()?;
            let time = r.u64()?;
            let session = r.str()?;
            let name = r.str()?;
            let features = r.str_list()?;
            Message::Welcome(Welcome {
                version,
                session,
                name,
                features,
                time,
            })
        }
        MessageType::Announce => {
            let namespace = r.str()?;
            let n = r.u16()? as usize;
            let mut signals = Vec::with_capacity(n.min(256));
            for _ in 0..n {
                signals.push(read_signal_info(r)?);
            }
            let bits = r.u8()?;
            let meta = (bits & 0x01 != 0).then(|| read_map(r)).transpose()?;
            Message::Announce(Announce {
                namespace,
                signals,
                meta,
            })
        }
        MessageType::Subscribe => {
            let id = r.u32()?;
            let pattern = r.str()?;
            let types = kinds_from_mask(r.u8()?);
            let bits = r.u8()?;
            let options = if bits != 0 {
                Some(SubscribeOptions {
                    max_rate: (bits & 0x01 != 0).then(|| r.u32()).transpose()?,
                    epsilon: (bits & 0x02 != 0).then(|| r.f64()).transpose()?,
                    history: (bits & 0x04 != 0).then(|| r.u32()).transpose()?,
                    window: (bits & 0x08 != 0).then(|| r.u32()).transpose()?,
                })
            } else {
                None
            };
            Message::Subscribe(Subscribe {
                id,
                pattern,
                types,
                options,
            })
        }
        MessageType::Unsubscribe => Message::Unsubscribe(Unsubscribe { id: r.u32()? }),
        MessageType::Publish => {
            let bits = r.u8()?;
            let address = r.str()?;
            let signal = (bits & 0x80 != 0)
                .then(|| -> Result<SignalKind> {
                    let code = r.u8()?;
                    SignalKind::from_code(code).ok_or(Error::Decode(format!(
                        "unknown signal kind code: {code}"
                    )))
                })
                .transpose()?;
            let value = (bits & 0x01 != 0).then(|| read_value(r)).transpose()?;
            let payload = (bits & 0x02 != 0).then(|| read_value(r)).transpose()?;
            let samples = if bits & 0x04 != 0 {
                let n = r.u16()? as usize;
                let mut s = Vec::with_capacity(n.min(4096));
                for _ in 0..n {
                    s.push(r.f64()?);
                }
                Some(s)
            } else {
                None
            };
            let timestamp = (bits & 0x08 != 0).then(|| r.u64()).transpose()?;
            let id = (bits & 0x10 != 0).then(|| r.u32()).transpose()?;
            let phase = (bits & 0x20 != 0)
                .then(|| -> Result<GesturePhase> {
                    let code = r.u8()?;
                    GesturePhase::from_code(code)
                        .ok_or(Error::Decode(format!("unknown gesture phase code: {code}")))
                })
                .transpose()?;
            let rate = (bits & 0x40 != 0).then(|| r.u32()).transpose()?;
            Message::Publish(Publish {
                address,
                signal,
                value,
                payload,
                samples,
                rate,
                id,
                phase,
                timestamp,
            })
        }
        MessageType::Set => {
            let bits = r.u8()?;
            let address = r.str()?;
            let value = read_value(r)?;
            let revision = (bits & 0x01 != 0).then(|| r.u64()).transpose()?;
            Message::Set(Set {
                address,
                value,
                revision,
                lock: bits & 0x02 != 0,
                unlock: bits & 0x04 != 0,
            })
        }
        MessageType::Get => Message::Get(Get { address: r.str()? }),
        MessageType::Snapshot => {
            let n = r.u16()? as usize;
            let mut params = Vec::with_capacity(n.min(1024));
            for _ in 0..n {
                let address = r.str()?;
                let value = read_value(r)?;
                let revision = r.u64()?;
                let bits = r.u8()?;
                let writer = (bits & 0x01 != 0).then(|| r.str()).transpose()?;
                let timestamp = (bits & 0x02 != 0).then(|| r.u64()).transpose()?;
                params.push(ParamSnapshot {
                    address,
                    value,
                    revision,
                    writer,
                    timestamp,
                });
            }
            Message::Snapshot(Snapshot { params })
        }
        MessageType::Bundle => {
            let bits = r.u8()?;
            let timestamp = (bits & 0x01 != 0).then(|| r.u64()).transpose()?;
            let n = r.u16()? as usize;
            let mut messages = Vec::with_capacity(n.min(256));
            for _ in 0..n {
                let len = r.u16()? as usize;
                let inner = r.take(len)?;
                let code = *inner.first().ok_or(Error::Truncated { needed: 1, have: 0 })?;
                let mut ir = Reader::new(&inner[1..]);
                messages.push(read_message(code, &mut ir)?);
            }
            Message::Bundle(Bundle {
                timestamp,
                messages,
            })
        }
        MessageType::Sync => {
            let bits = r.u8()?;
            let t1 = r.u64()?;
            let t2 = (bits & 0x01 != 0).then(|| r.u64()).transpose()?;
            let t3 = (bits & 0x02 != 0).then(|| r.u64()).transpose()?;
            Message::Sync(Sync { t1, t2, t3 })
        }
        MessageType::Ping => Message::Ping,
        MessageType::Pong => Message::Pong,
        MessageType::Ack => {
            let bits = r.u8()?;
            Message::Ack(Ack {
                address: (bits & 0x01 != 0).then(|| r.str()).transpose()?,
                revision: (bits & 0x02 != 0).then(|| r.u64()).transpose()?,
                locked: (bits & 0x04 != 0)
                    .then(|| r.u8().map(|b| b != 0))
                    .transpose()?,
                holder: (bits & 0x08 != 0).then(|| r.str()).transpose()?,
                correlation_id: (bits & 0x10 != 0).then(|| r.u32()).transpose()?,
            })
        }
        MessageType::Error => {
            let code = r.u16()?;
            let message = r.str()?;
            let bits = r.u8()?;
            Message::ErrorMsg(ErrorInfo {
                code,
                message,
                address: (bits & 0x01 != 0).then(|| r.str()).transpose()?,
                correlation_id: (bits & 0x02 != 0).then(|| r.u32()).transpose()?,
            })
        }
        MessageType::Query => Message::Query(Query { pattern: r.str()? }),
        MessageType::Result => {
            let n = r.u16()? as usize;
            let mut signals = Vec::with_capacity(n.min(1024));
            for _ in 0..n {
                signals.push(read_signal_info(r)?);
            }
            Message::QueryResult(QueryResult { signals })
        }
    })
}

fn read_signal_info(r: &mut Reader) -> Result<SignalInfo> {
    let address = r.str()?;
    let code = r.u8()?;
    let kind = SignalKind::from_code(code)
        .ok_or(Error::Decode(format!("unknown signal kind code: {code}")))?;
    let bits = r.u8()?;
    let datatype = (bits & 0x01 != 0).then(|| r.str()).transpose()?;
    Ok(SignalInfo {
        address,
        kind,
        datatype,
    })
}

fn read_map(r: &mut Reader) -> Result<BTreeMap<String, Value>> {
    let n = r.u16()? as usize;
    let mut map = BTreeMap::new();
    for _ in 0..n {
        let key = r.str()?;
        let value = read_value(r)?;
        map.insert(key, value);
    }
    Ok(map)
}

fn read_value(r: &mut Reader) -> Result<Value> {
    let code = r.u8()?;
    Ok(match code {
        val::NULL => Value::Null,
        val::BOOL => Value::Bool(r.u8()? != 0),
        val::I8 => Value::Int(r.u8()? as i8 as i64),
        val::I16 => Value::Int(r.u16()? as i16 as i64),
        val::I32 => Value::Int(r.u32()? as i32 as i64),
        val::I64 => Value::Int(r.i64()?),
        val::F32 => Value::Float(f32::from_bits(r.u32()?) as f64),
        val::F64 => Value::Float(r.f64()?),
        val::STRING => Value::String(r.str()?),
        val::BYTES => {
            let len = r.u16()? as usize;
            Value::Bytes(r.take(len)?.to_vec())
        }
        val::ARRAY => {
            let n = r.u16()? as usize;
            let mut items = Vec::with_capacity(n.min(4096));
            for _ in 0..n {
                items.push(read_value(r)?);
            }
            Value::Array(items)
        }
        val::MAP => Value::Map(read_map(r)?),
        other => return Err(Error::UnknownValueType(other)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_msg() -> Message {
        Message::Set(Set {
            address: "/a".into(),
            value: Value::Float(0.75),
            revision: None,
            lock: false,
            unlock: false,
        })
    }

    #[test]
    fn binary_set_fits_in_35_bytes() {
        let wire = encode(&set_msg()).unwrap();
        assert!(wire.len() <= 35, "SET frame is {} bytes", wire.len());
        let (decoded, frame) = decode(&wire).unwrap();
        assert_eq!(frame.flags.version, ENCODING_BINARY);
        match decoded {
            Message::Set(s) => {
                assert_eq!(s.address, "/a");
                assert_eq!(s.value, Value::Float(0.75));
            }
            other => panic!("expected SET, got {other:?}"),
        }
    }

    #[test]
    fn map_style_roundtrip_and_detection() {
        let wire = encode_with(&set_msg(), Encoding::Map, None, None).unwrap();
        let frame = Frame::decode(&wire[..]).unwrap();
        assert_eq!(frame.flags.version, ENCODING_MAP);
        assert_eq!(detect(&frame.payload), Some(Encoding::Map));
        let (decoded, _) = decode(&wire).unwrap();
        assert!(matches!(decoded, Message::Set(_)));
    }

    #[test]
    fn binary_smaller_than_map_style() {
        let binary = encode_payload(&set_msg(), Encoding::Binary).unwrap();
        let map = encode_payload(&set_msg(), Encoding::Map).unwrap();
        assert!(
            binary.len() * 2 <= map.len(),
            "binary {} vs map {}",
            binary.len(),
            map.len()
        );
    }

    #[test]
    fn unknown_kind_rejected() {
        assert!(matches!(
            decode_payload(&[0x7F, 0, 0]),
            Err(Error::UnknownKind(0x7F))
        ));
    }

    #[test]
    fn truncated_payload_rejected() {
        let payload = encode_payload(&set_msg(), Encoding::Binary).unwrap();
        for cut in 1..payload.len() {
            assert!(decode_payload(&payload[..cut]).is_err());
        }
    }

    #[test]
    fn bundle_roundtrip_nests_messages() {
        let bundle = Message::Bundle(Bundle {
            timestamp: Some(1_000_000),
            messages: vec![
                set_msg(),
                Message::Publish(Publish {
                    address: "/cue/go".into(),
                    signal: Some(SignalKind::Event),
                    value: Some(Value::String("intro".into())),
                    payload: None,
                    samples: None,
                    rate: None,
                    id: None,
                    phase: None,
                    timestamp: None,
                }),
            ],
        });
        let wire = encode(&bundle).unwrap();
        let (decoded, frame) = decode(&wire).unwrap();
        assert_eq!(frame.flags.qos, QoS::Commit);
        match decoded {
            Message::Bundle(b) => {
                assert_eq!(b.timestamp, Some(1_000_000));
                assert_eq!(b.messages.len(), 2);
            }
            other => panic!("expected BUNDLE, got {other:?}"),
        }
    }

    #[test]
    fn gesture_publish_roundtrip() {
        let msg = Message::Publish(Publish {
            address: "/touch/pad".into(),
            signal: Some(SignalKind::Gesture),
            value: None,
            payload: Some(Value::Array(vec![Value::Float(0.1), Value::Float(0.9)])),
            samples: None,
            rate: None,
            id: Some(7),
            phase: Some(GesturePhase::Move),
            timestamp: Some(42),
        });
        let wire = encode(&msg).unwrap();
        let (decoded, _) = decode(&wire).unwrap();
        match decoded {
            Message::Publish(p) => {
                assert_eq!(p.id, Some(7));
                assert_eq!(p.phase, Some(GesturePhase::Move));
                assert_eq!(p.signal, Some(SignalKind::Gesture));
            }
            other => panic!("expected PUBLISH, got {other:?}"),
        }
    }

    #[test]
    fn narrow_int_codes_accepted_inbound() {
        // A peer may emit i8/i16/i32/f32 codes; they widen on decode.
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::Set as u8);
        buf.put_u8(0); // no revision/lock/unlock
        buf.put_u16(2);
        buf.extend_from_slice(b"/x");
        buf.put_u8(val::I8);
        buf.put_u8(0x80); // -128
        let msg = decode_payload(&buf).unwrap();
        match msg {
            Message::Set(s) => assert_eq!(s.value, Value::Int(-128)),
            other => panic!("expected SET, got {other:?}"),
        }
    }

    #[test]
    fn every_value_shape_roundtrips() {
        let mut map = BTreeMap::new();
        map.insert("k".to_string(), Value::Int(1));
        let shapes = vec![
            Value::Null,
            Value::Bool(true),
            Value::Int(-42),
            Value::Float(3.25),
            Value::String("hello".into()),
            Value::Bytes(vec![1, 2, 3]),
            Value::Array(vec![Value::Int(1), Value::String("two".into())]),
            Value::Map(map),
        ];
        for value in shapes {
            let msg = Message::Set(Set {
                address: "/v".into(),
                value: value.clone(),
                revision: Some(9),
                lock: false,
                unlock: false,
            });
            let (decoded, _) = decode(&encode(&msg).unwrap()).unwrap();
            match decoded {
                Message::Set(s) => assert_eq!(s.value, value),
                other => panic!("expected SET, got {other:?}"),
            }
        }
    }
}
