//! Art-Net driver
//!
//! DMX data frames for (net, subnet, universe) map slot-by-slot onto
//! `{ns}/{net}/{subnet}/{universe}/{1..512}` Params, with delta
//! detection so an unchanged slot produces no traffic. Outbound SETs
//! accumulate into per-universe buffers flushed as ArtDmx packets.

use crate::driver::{BridgeDriver, DriverEvent};
use crate::error::{BridgeError, Result};
use artnet_protocol::{ArtCommand, Output};
use async_trait::async_trait;
use clasp_core::{Message, Set, Value};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub const ARTNET_PORT: u16 = 6454;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArtnetConfig {
    pub bind: String,
    /// Node to send DMX to; broadcast when unset.
    pub peer: Option<String>,
    /// Restrict inbound processing to these port addresses.
    pub universes: Vec<u16>,
}

impl Default for ArtnetConfig {
    fn default() -> Self {
        Self {
            bind: format!("0.0.0.0:{ARTNET_PORT}"),
            peer: None,
            universes: Vec::new(),
        }
    }
}

/// Split a 15-bit port address into (net, subnet, universe).
fn split_port_address(pa: u16) -> (u16, u16, u16) {
    ((pa >> 8) & 0x7F, (pa >> 4) & 0x0F, pa & 0x0F)
}

fn join_port_address(net: u16, subnet: u16, universe: u16) -> u16 {
    ((net & 0x7F) << 8) | ((subnet & 0x0F) << 4) | (universe & 0x0F)
}

pub struct ArtnetDriver {
    namespace: String,
    config: ArtnetConfig,
    socket: Option<Arc<UdpSocket>>,
    /// Outbound DMX buffers per port address.
    output_state: HashMap<u16, [u8; 512]>,
    stop: Option<tokio::sync::watch::Sender<bool>>,
}

impl ArtnetDriver {
    pub fn new(namespace: &str, config: ArtnetConfig) -> Self {
        Self {
            namespace: namespace.trim_end_matches('/').to_string(),
            config,
            socket: None,
            output_state: HashMap::new(),
            stop: None,
        }
    }
}

#[async_trait]
impl BridgeDriver for ArtnetDriver {
    fn kind(&self) -> &'static str {
        "artnet"
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn start(&mut self) -> Result<mpsc::Receiver<DriverEvent>> {
        let socket = Arc::new(
            UdpSocket::bind(&self.config.bind)
                .await
                .map_err(|e| BridgeError::Transient(format!("artnet bind: {e}")))?,
        );
        socket.set_broadcast(true).ok();
        info!(bind = %self.config.bind, "artnet driver listening");
        self.socket = Some(socket.clone());

        let (tx, rx) = mpsc::channel(512);
        let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
        self.stop = Some(stop_tx);
        let namespace = self.namespace.clone();
        let universes = self.config.universes.clone();
        let inbound_state: Arc<Mutex<HashMap<u16, [u8; 512]>>> =
            Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
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
                        match ArtCommand::from_buffer(&buf[..len]) {
                            Ok(ArtCommand::Output(output)) => {
                                let messages = dmx_frame_to_sets(
                                    &namespace,
                                    &universes,
                                    &output,
                                    &inbound_state,
                                );
                                for message in messages {
                                    if tx.send(DriverEvent::Inbound(message)).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Ok(_) => {}
                            Err(e) => debug!(%from, "artnet decode failed: {e:?}"),
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
        });

        Ok(rx)
    }

    async fn outbound(&mut self, message: &Message) -> Result<()> {
        let Some((port_address, slot, value)) = parse_slot_address(&self.namespace, message) else {
            return Ok(());
        };
        let buffer = self.output_state.entry(port_address).or_insert([0u8; 512]);
        buffer[(slot - 1) as usize] = value;
        let data = buffer.to_vec();

        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| BridgeError::Transient("artnet driver not started".into()))?;
        let target: SocketAddr = match &self.config.peer {
            Some(peer) => peer
                .parse()
                .map_err(|e| BridgeError::Config(format!("bad artnet peer: {e}")))?,
            None => format!("255.255.255.255:{ARTNET_PORT}")
                .parse()
                .expect("static addr"),
        };

        let mut output = Output::default();
        output.subnet = port_address;
        output.length = data.len() as u16;
        output.data = data.into();
        let bytes = ArtCommand::Output(output)
            .into_buffer()
            .map_err(|e| BridgeError::Protocol(format!("artnet encode: {e:?}")))?;
        socket
            .send_to(&bytes, target)
            .await
            .map_err(|e| BridgeError::Transient(e.to_string()))?;
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
        self.socket = None;
    }
}

/// Inbound ArtDmx → SETs for changed slots only.
fn dmx_frame_to_sets(
    namespace: &str,
    universes: &[u16],
    output: &Output,
    state: &Arc<Mutex<HashMap<u16, [u8; 512]>>>,
) -> Vec<Message> {
    let port_address = output.subnet;
    if !universes.is_empty() && !universes.contains(&port_address) {
        return Vec::new();
    }
    let (net, subnet, universe) = split_port_address(port_address);
    let data: &[u8] = &output.data;

    let mut state = state.lock();
    let previous = state.entry(port_address).or_insert([0u8; 512]);
    let mut messages = Vec::new();
    for (i, &value) in data.iter().take(512).enumerate() {
        if previous[i] != value {
            previous[i] = value;
            messages.push(Message::Set(Set {
                address: format!("{namespace}/{net}/{subnet}/{universe}/{}", i + 1),
                value: Value::Int(value as i64),
                revision: None,
                lock: false,
                unlock: false,
            }));
        }
    }
    messages
}

/// Outbound SET on `{ns}/{net}/{subnet}/{universe}/{slot}` →
/// (port address, slot, dmx value).
fn parse_slot_address(namespace: &str, message: &Message) -> Option<(u16, u16, u8)> {
    let set = match message {
        Message::Set(set) => set,
        _ => return None,
    };
    let rest = set.address.strip_prefix(namespace)?.strip_prefix('/')?;
    let mut parts = rest.split('/');
    let net: u16 = parts.next()?.parse().ok()?;
    let subnet: u16 = parts.next()?.parse().ok()?;
    let universe: u16 = parts.next()?.parse().ok()?;
    let slot: u16 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || !(1..=512).contains(&slot) {
        return None;
    }
    let value = set.value.as_i64()?.clamp(0, 255) as u8;
    Some((join_port_address(net, subnet, universe), slot, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_address_split_join() {
        for pa in [0u16, 1, 0x0010, 0x0123, 0x7FFF] {
            let (net, subnet, universe) = split_port_address(pa);
            assert_eq!(join_port_address(net, subnet, universe), pa & 0x7FFF);
        }
    }

    #[test]
    fn changed_slots_only() {
        let state = Arc::new(Mutex::new(HashMap::new()));
        let mut output = Output::default();
        output.subnet = 0x0012; // net 0, subnet 1, universe 2
        let mut data = vec![0u8; 512];
        data[0] = 255;
        data[9] = 10;
        output.length = 512;
        output.data = data.clone().into();

        let first = dmx_frame_to_sets("/artnet", &[], &output, &state);
        let addrs: Vec<&str> = first
            .iter()
            .map(|m| match m {
                Message::Set(s) => s.address.as_str(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(addrs, vec!["/artnet/0/1/2/1", "/artnet/0/1/2/10"]);

        // Same frame again: nothing changed, nothing emitted.
        let second = dmx_frame_to_sets("/artnet", &[], &output, &state);
        assert!(second.is_empty());

        // One slot changes.
        data[9] = 11;
        output.data = data.into();
        let third = dmx_frame_to_sets("/artnet", &[], &output, &state);
        assert_eq!(third.len(), 1);
    }

    #[test]
    fn universe_filter_applies() {
        let state = Arc::new(Mutex::new(HashMap::new()));
        let mut output = Output::default();
        output.subnet = 5;
        output.data = vec![1u8; 512].into();
        assert!(dmx_frame_to_sets("/artnet", &[4], &output, &state).is_empty());
        assert!(!dmx_frame_to_sets("/artnet", &[5], &output, &state).is_empty());
    }

    #[test]
    fn slot_address_parsing() {
        let set = |addr: &str, v: i64| {
            Message::Set(Set {
                address: addr.into(),
                value: Value::Int(v),
                revision: None,
                lock: false,
                unlock: false,
            })
        };
        assert_eq!(
            parse_slot_address("/artnet", &set("/artnet/0/1/2/1", 255)),
            Some((0x0012, 1, 255))
        );
        assert_eq!(parse_slot_address("/artnet", &set("/artnet/0/1/2/0", 1)), None);
        assert_eq!(parse_slot_address("/artnet", &set("/artnet/0/1/2/513", 1)), None);
        assert_eq!(parse_slot_address("/artnet", &set("/other/0/1/2/1", 1)), None);
    }
}
