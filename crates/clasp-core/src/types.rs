//! Protocol message set and value model

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Message type codes shared by both payload encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    Welcome = 0x02,
    Announce = 0x03,
    Subscribe = 0x10,
    Unsubscribe = 0x11,
    Publish = 0x20,
    Set = 0x21,
    Get = 0x22,
    Snapshot = 0x23,
    Bundle = 0x30,
    Sync = 0x40,
    Ping = 0x41,
    Pong = 0x42,
    Ack = 0x50,
    Error = 0x51,
    Query = 0x60,
    Result = 0x61,
}

impl MessageType {
    pub fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => MessageType::Hello,
            0x02 => MessageType::Welcome,
            0x03 => MessageType::Announce,
            0x10 => MessageType::Subscribe,
            0x11 => MessageType::Unsubscribe,
            0x20 => MessageType::Publish,
            0x21 => MessageType::Set,
            0x22 => MessageType::Get,
            0x23 => MessageType::Snapshot,
            0x30 => MessageType::Bundle,
            0x40 => MessageType::Sync,
            0x41 => MessageType::Ping,
            0x42 => MessageType::Pong,
            0x50 => MessageType::Ack,
            0x51 => MessageType::Error,
            0x60 => MessageType::Query,
            0x61 => MessageType::Result,
            _ => return None,
        })
    }
}

/// Delivery discipline carried in the frame flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum QoS {
    /// Best effort, droppable.
    #[default]
    Fire = 0,
    /// At-least-once; acknowledged.
    Confirm = 1,
    /// Exactly-once, ordered.
    Commit = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::Fire),
            1 => Some(QoS::Confirm),
            2 => Some(QoS::Commit),
            _ => None,
        }
    }
}

/// The five signal kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    /// Stateful, retained; revisioned by the store.
    Param,
    /// One-shot, not retained.
    Event,
    /// High-rate sample, fire-and-forget by default.
    Stream,
    /// Phased input with a gesture id.
    Gesture,
    /// Ordered, committed automation frame.
    Timeline,
}

impl SignalKind {
    pub fn code(self) -> u8 {
        match self {
            SignalKind::Param => 0,
            SignalKind::Event => 1,
            SignalKind::Stream => 2,
            SignalKind::Gesture => 3,
            SignalKind::Timeline => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => SignalKind::Param,
            1 => SignalKind::Event,
            2 => SignalKind::Stream,
            3 => SignalKind::Gesture,
            4 => SignalKind::Timeline,
            _ => return None,
        })
    }

    /// Bit used in subscription kind masks.
    pub fn mask_bit(self) -> u8 {
        1 << self.code()
    }

    pub fn default_qos(self) -> QoS {
        match self {
            SignalKind::Param | SignalKind::Event => QoS::Confirm,
            SignalKind::Stream | SignalKind::Gesture => QoS::Fire,
            SignalKind::Timeline => QoS::Commit,
        }
    }
}

/// Gesture lifecycle phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GesturePhase {
    Start,
    Move,
    End,
    Cancel,
}

impl GesturePhase {
    pub fn code(self) -> u8 {
        match self {
            GesturePhase::Start => 0,
            GesturePhase::Move => 1,
            GesturePhase::End => 2,
            GesturePhase::Cancel => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => GesturePhase::Start,
            1 => GesturePhase::Move,
            2 => GesturePhase::End,
            3 => GesturePhase::Cancel,
            _ => return None,
        })
    }
}

/// Value model for signal payloads.
///
/// Variant order matters for `serde(untagged)`: Array must precede Bytes so
/// MessagePack arrays of small integers don't deserialize as binary blobs.
/// Maps use `BTreeMap` so both encodings serialize entries in one
/// deterministic order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Bytes(Vec<u8>),
}

impl Value {
    /// Numeric view, used by epsilon filtering and range constraints.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v as f64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

/// The protocol message set.
///
/// The `type` tag and field names below are the wire contract of the
/// map-style payload encoding; unknown top-level keys are ignored on
/// decode for forward compatibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "HELLO")]
    Hello(Hello),
    #[serde(rename = "WELCOME")]
    Welcome(Welcome),
    #[serde(rename = "ANNOUNCE")]
    Announce(Announce),
    #[serde(rename = "SUBSCRIBE")]
    Subscribe(Subscribe),
    #[serde(rename = "UNSUBSCRIBE")]
    Unsubscribe(Unsubscribe),
    #[serde(rename = "PUBLISH")]
    Publish(Publish),
    #[serde(rename = "SET")]
    Set(Set),
    #[serde(rename = "GET")]
    Get(Get),
    #[serde(rename = "SNAPSHOT")]
    Snapshot(Snapshot),
    #[serde(rename = "BUNDLE")]
    Bundle(Bundle),
    #[serde(rename = "SYNC")]
    Sync(Sync),
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "PONG")]
    Pong,
    #[serde(rename = "ACK")]
    Ack(Ack),
    #[serde(rename = "ERROR")]
    ErrorMsg(ErrorInfo),
    #[serde(rename = "QUERY")]
    Query(Query),
    #[serde(rename = "RESULT")]
    QueryResult(QueryResult),
}

/// HELLO: first message of every session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub version: u8,
    pub name: String,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// WELCOME: handshake acceptance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Welcome {
    pub version: u8,
    pub session: String,
    pub name: String,
    #[serde(default)]
    pub features: Vec<String>,
    /// Router wall clock, microseconds.
    pub time: u64,
}

/// ANNOUNCE: namespace/service advertisement, also the discovery reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announce {
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signals: Vec<SignalInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<BTreeMap<String, Value>>,
}

/// One addressable signal, as returned by QUERY.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalInfo {
    pub address: String,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datatype: Option<String>,
}

/// SUBSCRIBE: register interest in a pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscribe {
    pub id: u32,
    pub pattern: String,
    /// Empty means all kinds.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<SignalKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<SubscribeOptions>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscribeOptions {
    /// Max deliveries per second per address; excess dropped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rate: Option<u32>,
    /// Minimum numeric change between deliveries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epsilon: Option<f64>,
    /// Historical values wanted at subscribe time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<u32>,
    /// Stream coalescing window, microseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unsubscribe {
    pub id: u32,
}

/// PUBLISH: non-retained signal delivery (Event/Stream/Gesture/Timeline).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Publish {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<SignalKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Stream sample block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub samples: Option<Vec<f64>>,
    /// Stream sample rate, Hz.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<u32>,
    /// Gesture id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<GesturePhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl Publish {
    /// The kind this publish is dispatched as (Event when unspecified).
    pub fn kind(&self) -> SignalKind {
        self.signal.unwrap_or(SignalKind::Event)
    }
}

/// SET: write a Param.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Set {
    pub address: String,
    pub value: Value,
    /// Optimistic-concurrency hint; mismatch rejects the write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub lock: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unlock: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Get {
    pub address: String,
}

/// SNAPSHOT: retained Param state for a pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub params: Vec<ParamSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSnapshot {
    pub address: String,
    pub value: Value,
    pub revision: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

/// BUNDLE: atomic, optionally scheduled group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    /// Execution time in router time, microseconds. Absent = immediate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    pub messages: Vec<Message>,
}

/// SYNC: NTP-style three-timestamp exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sync {
    pub t1: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t2: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t3: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ack {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
    #[serde(
        rename = "correlationId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<u32>,
}

/// ERROR: `{ code, message, address?, correlationId? }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(
        rename = "correlationId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub signals: Vec<SignalInfo>,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Hello(_) => MessageType::Hello,
            Message::Welcome(_) => MessageType::Welcome,
            Message::Announce(_) => MessageType::Announce,
            Message::Subscribe(_) => MessageType::Subscribe,
            Message::Unsubscribe(_) => MessageType::Unsubscribe,
            Message::Publish(_) => MessageType::Publish,
            Message::Set(_) => MessageType::Set,
            Message::Get(_) => MessageType::Get,
            Message::Snapshot(_) => MessageType::Snapshot,
            Message::Bundle(_) => MessageType::Bundle,
            Message::Sync(_) => MessageType::Sync,
            Message::Ping => MessageType::Ping,
            Message::Pong => MessageType::Pong,
            Message::Ack(_) => MessageType::Ack,
            Message::ErrorMsg(_) => MessageType::Error,
            Message::Query(_) => MessageType::Query,
            Message::QueryResult(_) => MessageType::Result,
        }
    }

    /// Default QoS when the sender does not pick one in the frame flags.
    pub fn default_qos(&self) -> QoS {
        match self {
            Message::Set(_) => QoS::Confirm,
            Message::Publish(p) => p.kind().default_qos(),
            Message::Bundle(_) => QoS::Commit,
            Message::Subscribe(_) | Message::Unsubscribe(_) => QoS::Confirm,
            _ => QoS::Fire,
        }
    }
}

/// Build the kind mask byte from a SUBSCRIBE `types` list (empty = all).
pub fn kind_mask(types: &[SignalKind]) -> u8 {
    if types.is_empty() {
        0x1F
    } else {
        types.iter().fold(0, |m, k| m | k.mask_bit())
    }
}

/// Expand a kind mask byte back into a list (all five → empty list).
pub fn kinds_from_mask(mask: u8) -> Vec<SignalKind> {
    if mask & 0x1F == 0x1F {
        return Vec::new();
    }
    [
        SignalKind::Param,
        SignalKind::Event,
        SignalKind::Stream,
        SignalKind::Gesture,
        SignalKind::Timeline,
    ]
    .into_iter()
    .filter(|k| mask & k.mask_bit() != 0)
    .collect()
}
