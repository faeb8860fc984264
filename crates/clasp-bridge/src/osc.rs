//! OSC driver
//!
//! OSC path ↔ CLASP address (prefixed with the bridge namespace). A
//! single argument unwraps to a scalar value, multiple arguments become
//! an array. OSC bundles map to CLASP bundles carrying the timetag as
//! execution time.

use crate::driver::{BridgeDriver, DriverEvent};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use clasp_core::time::Micros;
use clasp_core::{Bundle, Message, Publish, Set, Value};
use parking_lot::Mutex;
use rosc::{OscBundle, OscMessage, OscPacket, OscTime, OscType};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Seconds between the NTP and Unix epochs.
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OscConfig {
    pub bind: String,
    /// Fixed send target; defaults to replying to the last sender.
    pub peer: Option<String>,
}

impl Default for OscConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
            peer: None,
        }
    }
}

pub struct OscDriver {
    namespace: String,
    config: OscConfig,
    socket: Option<Arc<UdpSocket>>,
    /// Reply target learned from inbound traffic.
    last_peer: Arc<Mutex<Option<SocketAddr>>>,
    stop: Option<tokio::sync::watch::Sender<bool>>,
}

impl OscDriver {
    pub fn new(namespace: &str, config: OscConfig) -> Self {
        Self {
            namespace: namespace.trim_end_matches('/').to_string(),
            config,
            socket: None,
            last_peer: Arc::new(Mutex::new(None)),
            stop: None,
        }
    }
}

#[async_trait]
impl BridgeDriver for OscDriver {
    fn kind(&self) -> &'static str {
        "osc"
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn start(&mut self) -> Result<mpsc::Receiver<DriverEvent>> {
        let socket = Arc::new(
            UdpSocket::bind(&self.config.bind)
                .await
                .map_err(|e| BridgeError::Transient(format!("osc bind {}: {e}", self.config.bind)))?,
        );
        info!(bind = %self.config.bind, "osc driver listening");
        self.socket = Some(socket.clone());

        let (tx, rx) = mpsc::channel(256);
        let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
        self.stop = Some(stop_tx);
        let namespace = self.namespace.clone();
        let last_peer = self.last_peer.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 65_536];
            loop {
                tokio::select! {
                    received = socket.recv_from(&mut buf) => {
                        let (len, from) = match received {
                            Ok(got) => got,
                            Err(e) => {
                                let _ = tx.send(DriverEvent::Fault {
                                    fatal: false,
                                    detail: e.to_string(),
                                }).await;
                                break;
                            }
                        };
                        *last_peer.lock() = Some(from);
                        match rosc::decoder::decode_udp(&buf[..len]) {
                            Ok((_, packet)) => {
                                for message in packet_to_messages(packet, &namespace) {
                                    if tx.send(DriverEvent::Inbound(message)).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(e) => debug!(%from, "osc decode failed: {e:?}"),
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
        });

        Ok(rx)
    }

    async fn outbound(&mut self, message: &Message) -> Result<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| BridgeError::Transient("osc driver not started".into()))?;
        let target = match &self.config.peer {
            Some(peer) => peer
                .parse::<SocketAddr>()
                .map_err(|e| BridgeError::Config(format!("bad osc peer: {e}")))?,
            None => match *self.last_peer.lock() {
                Some(addr) => addr,
                None => return Ok(()), // nobody to talk to yet
            },
        };
        if let Some(packet) = message_to_packet(message, &self.namespace) {
            let bytes = rosc::encoder::encode(&packet)
                .map_err(|e| BridgeError::Protocol(format!("osc encode: {e:?}")))?;
            socket
                .send_to(&bytes, target)
                .await
                .map_err(|e| BridgeError::Transient(e.to_string()))?;
        }
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
        self.socket = None;
    }
}

fn packet_to_messages(packet: OscPacket, namespace: &str) -> Vec<Message> {
    match packet {
        OscPacket::Message(msg) => vec![osc_to_set(msg, namespace)],
        OscPacket::Bundle(bundle) => {
            let messages = bundle
                .content
                .into_iter()
                .flat_map(|inner| packet_to_messages(inner, namespace))
                .collect();
            vec![Message::Bundle(Bundle {
                timestamp: osc_time_to_micros(bundle.timetag),
                messages,
            })]
        }
    }
}

fn osc_to_set(msg: OscMessage, namespace: &str) -> Message {
    let value = match msg.args.len() {
        0 => Value::Null,
        1 => osc_arg_to_value(&msg.args[0]),
        _ => Value::Array(msg.args.iter().map(osc_arg_to_value).collect()),
    };
    Message::Set(Set {
        address: format!("{namespace}{}", msg.addr),
        value,
        revision: None,
        lock: false,
        unlock: false,
    })
}

fn message_to_packet(message: &Message, namespace: &str) -> Option<OscPacket> {
    match message {
        Message::Set(set) => Some(OscPacket::Message(OscMessage {
            addr: strip_namespace(&set.address, namespace),
            args: value_to_osc_args(&set.value),
        })),
        Message::Publish(Publish {
            address,
            value,
            payload,
            ..
        }) => {
            let args = value
                .as_ref()
                .or(payload.as_ref())
                .map(value_to_osc_args)
                .unwrap_or_default();
            Some(OscPacket::Message(OscMessage {
                addr: strip_namespace(address, namespace),
                args,
            }))
        }
        Message::Bundle(bundle) => {
            let content: Vec<OscPacket> = bundle
                .messages
                .iter()
                .filter_map(|inner| message_to_packet(inner, namespace))
                .collect();
            Some(OscPacket::Bundle(OscBundle {
                timetag: micros_to_osc_time(bundle.timestamp),
                content,
            }))
        }
        _ => None,
    }
}

fn strip_namespace(address: &str, namespace: &str) -> String {
    address
        .strip_prefix(namespace)
        .filter(|rest| rest.starts_with('/'))
        .unwrap_or(address)
        .to_string()
}

fn osc_arg_to_value(arg: &OscType) -> Value {
    match arg {
        OscType::Int(i) => Value::Int(*i as i64),
        OscType::Long(l) => Value::Int(*l),
        OscType::Float(f) => Value::Float(*f as f64),
        OscType::Double(d) => Value::Float(*d),
        OscType::String(s) => Value::String(s.clone()),
        OscType::Blob(b) => Value::Bytes(b.clone()),
        OscType::Bool(b) => Value::Bool(*b),
        OscType::Nil => Value::Null,
        _ => Value::Null,
    }
}

fn value_to_osc_args(value: &Value) -> Vec<OscType> {
    match value {
        Value::Null => vec![],
        Value::Bool(b) => vec![OscType::Bool(*b)],
        Value::Int(i) => vec![OscType::Long(*i)],
        Value::Float(f) => vec![OscType::Double(*f)],
        Value::String(s) => vec![OscType::String(s.clone())],
        Value::Bytes(b) => vec![OscType::Blob(b.clone())],
        Value::Array(items) => items.iter().flat_map(value_to_osc_args).collect(),
        Value::Map(_) => vec![OscType::String(
            serde_json::to_string(&crate::json::value_to_json(value)).unwrap_or_default(),
        )],
    }
}

fn osc_time_to_micros(time: OscTime) -> Option<Micros> {
    let seconds = (time.seconds as u64).checked_sub(NTP_UNIX_OFFSET)?;
    let micros = (time.fractional as u64 * 1_000_000) >> 32;
    Some(seconds * 1_000_000 + micros)
}

fn micros_to_osc_time(micros: Option<Micros>) -> OscTime {
    match micros {
        // "Immediately" in OSC is the smallest non-zero timetag.
        None => OscTime {
            seconds: 0,
            fractional: 1,
        },
        Some(us) => OscTime {
            seconds: (us / 1_000_000 + NTP_UNIX_OFFSET) as u32,
            fractional: (((us % 1_000_000) << 32) / 1_000_000) as u32,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_arg_unwraps_to_scalar() {
        let msg = OscMessage {
            addr: "/fader/1".into(),
            args: vec![OscType::Float(0.5)],
        };
        match osc_to_set(msg, "/osc") {
            Message::Set(set) => {
                assert_eq!(set.address, "/osc/fader/1");
                assert_eq!(set.value, Value::Float(0.5));
            }
            other => panic!("expected SET, got {other:?}"),
        }
    }

    #[test]
    fn multiple_args_become_array() {
        let msg = OscMessage {
            addr: "/xy".into(),
            args: vec![OscType::Float(0.1), OscType::Float(0.9)],
        };
        match osc_to_set(msg, "/osc") {
            Message::Set(set) => {
                assert_eq!(
                    set.value,
                    Value::Array(vec![Value::Float(0.1f32 as f64), Value::Float(0.9f32 as f64)])
                );
            }
            other => panic!("expected SET, got {other:?}"),
        }
    }

    #[test]
    fn args_roundtrip_losslessly() {
        for (arg, value) in [
            (OscType::Long(7), Value::Int(7)),
            (OscType::Double(0.25), Value::Float(0.25)),
            (OscType::String("go".into()), Value::String("go".into())),
            (OscType::Blob(vec![1, 2]), Value::Bytes(vec![1, 2])),
            (OscType::Bool(true), Value::Bool(true)),
        ] {
            assert_eq!(osc_arg_to_value(&arg), value);
            assert_eq!(value_to_osc_args(&value), vec![arg]);
        }
    }

    #[test]
    fn bundle_keeps_execution_time() {
        let at = OscTime {
            seconds: (NTP_UNIX_OFFSET + 100) as u32,
            fractional: 0,
        };
        let bundle = OscPacket::Bundle(OscBundle {
            timetag: at,
            content: vec![OscPacket::Message(OscMessage {
                addr: "/a".into(),
                args: vec![OscType::Float(1.0)],
            })],
        });
        match packet_to_messages(bundle, "/osc").pop().unwrap() {
            Message::Bundle(b) => {
                assert_eq!(b.timestamp, Some(100_000_000));
                assert_eq!(b.messages.len(), 1);
            }
            other => panic!("expected BUNDLE, got {other:?}"),
        }
    }

    #[test]
    fn timetag_conversion_roundtrips() {
        let us = 1_719_000_000_123_456u64;
        let tag = micros_to_osc_time(Some(us));
        let back = osc_time_to_micros(tag).unwrap();
        assert!(us.abs_diff(back) <= 1);
    }

    #[test]
    fn outbound_strips_namespace() {
        let set = Message::Set(Set {
            address: "/osc/fader/1".into(),
            value: Value::Float(0.5),
            revision: Some(3),
            lock: false,
            unlock: false,
        });
        match message_to_packet(&set, "/osc").unwrap() {
            OscPacket::Message(m) => assert_eq!(m.addr, "/fader/1"),
            other => panic!("expected message, got {other:?}"),
        }
    }
}
