//! sACN (E1.31) driver
//!
//! Streaming ACN data packets map onto `{ns}/{universe}/{1..512}`
//! Params with the same delta suppression as Art-Net. Packets are built
//! and parsed directly; the format is three fixed layers over UDP
//! multicast (239.255.hi.lo:5568).

use crate::driver::{BridgeDriver, DriverEvent};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use clasp_core::{Message, Set, Value};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub const SACN_PORT: u16 = 5568;
const ACN_PACKET_ID: [u8; 12] = *b"ASC-E1.17\0\0\0";
const VECTOR_ROOT_DATA: u32 = 0x0000_0004;
const VECTOR_FRAMING_DATA: u32 = 0x0000_0002;
const VECTOR_DMP_SET: u8 = 0x02;
const PACKET_LEN: usize = 638;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SacnConfig {
    /// Universes to receive; also the set this driver may transmit on.
    pub universes: Vec<u16>,
    pub source_name: String,
    pub priority: u8,
}

impl Default for SacnConfig {
    fn default() -> Self {
        Self {
            universes: vec![1],
            source_name: "CLASP".to_string(),
            priority: 100,
        }
    }
}

pub struct SacnDriver {
    namespace: String,
    config: SacnConfig,
    cid: [u8; 16],
    socket: Option<Arc<UdpSocket>>,
    output_state: HashMap<u16, [u8; 512]>,
    sequences: HashMap<u16, u8>,
    stop: Option<tokio::sync::watch::Sender<bool>>,
}

impl SacnDriver {
    pub fn new(namespace: &str, config: SacnConfig) -> Self {
        let mut cid = [0u8; 16];
        cid.copy_from_slice(uuid::Uuid::new_v4().as_bytes());
        Self {
            namespace: namespace.trim_end_matches('/').to_string(),
            config,
            cid,
            socket: None,
            output_state: HashMap::new(),
            sequences: HashMap::new(),
            stop: None,
        }
    }
}

fn multicast_group(universe: u16) -> Ipv4Addr {
    Ipv4Addr::new(239, 255, (universe >> 8) as u8, (universe & 0xFF) as u8)
}

#[async_trait]
impl BridgeDriver for SacnDriver {
    fn kind(&self) -> &'static str {
        "sacn"
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn start(&mut self) -> Result<mpsc::Receiver<DriverEvent>> {
        let socket = Arc::new(
            UdpSocket::bind(format!("0.0.0.0:{SACN_PORT}"))
                .await
                .map_err(|e| BridgeError::Transient(format!("sacn bind: {e}")))?,
        );
        for universe in &self.config.universes {
            socket
                .join_multicast_v4(multicast_group(*universe), Ipv4Addr::UNSPECIFIED)
                .map_err(|e| BridgeError::Transient(format!("sacn multicast join: {e}")))?;
        }
        info!(universes = ?self.config.universes, "sacn driver listening");
        self.socket = Some(socket.clone());

        let (tx, rx) = mpsc::channel(512);
        let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
        self.stop = Some(stop_tx);
        let namespace = self.namespace.clone();
        let universes = self.config.universes.clone();
        let inbound_state: Arc<Mutex<HashMap<u16, [u8; 512]>>> =
            Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
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
                        let Some((universe, _seq, data)) = parse_data_packet(&buf[..len]) else {
                            debug!(%from, "ignoring non-data sacn packet");
                            continue;
                        };
                        if !universes.contains(&universe) {
                            continue;
                        }
                        let mut state = inbound_state.lock();
                        let previous = state.entry(universe).or_insert([0u8; 512]);
                        for (i, &value) in data.iter().enumerate() {
                            if previous[i] != value {
                                previous[i] = value;
                                let message = Message::Set(Set {
                                    address: format!("{namespace}/{universe}/{}", i + 1),
                                    value: Value::Int(value as i64),
                                    revision: None,
                                    lock: false,
                                    unlock: false,
                                });
                                if tx.try_send(DriverEvent::Inbound(message)).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
        });

        Ok(rx)
    }

    async fn outbound(&mut self, message: &Message) -> Result<()> {
        let Some((universe, slot, value)) = parse_slot(&self.namespace, message) else {
            return Ok(());
        };
        if !self.config.universes.contains(&universe) {
            return Ok(());
        }
        let buffer = self.output_state.entry(universe).or_insert([0u8; 512]);
        buffer[(slot - 1) as usize] = value;
        let data = *buffer;

        let seq = self.sequences.entry(universe).or_insert(0);
        *seq = seq.wrapping_add(1);
        let packet = encode_data_packet(
            &self.cid,
            &self.config.source_name,
            self.config.priority,
            universe,
            *seq,
            &data,
        );

        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| BridgeError::Transient("sacn driver not started".into()))?;
        let target = SocketAddr::from((multicast_group(universe), SACN_PORT));
        socket
            .send_to(&packet, target)
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

fn parse_slot(namespace: &str, message: &Message) -> Option<(u16, u16, u8)> {
    let set = match message {
        Message::Set(set) => set,
        _ => return None,
    };
    let rest = set.address.strip_prefix(namespace)?.strip_prefix('/')?;
    let mut parts = rest.split('/');
    let universe: u16 = parts.next()?.parse().ok()?;
    let slot: u16 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || !(1..=512).contains(&slot) {
        return None;
    }
    Some((universe, slot, set.value.as_i64()?.clamp(0, 255) as u8))
}

/// Build one E1.31 data packet: root, framing and DMP layers.
pub fn encode_data_packet(
    cid: &[u8; 16],
    source_name: &str,
    priority: u8,
    universe: u16,
    sequence: u8,
    data: &[u8; 512],
) -> Vec<u8> {
    let mut p = Vec::with_capacity(PACKET_LEN);

    // Root layer.
    p.extend_from_slice(&0x0010u16.to_be_bytes()); // preamble size
    p.extend_from_slice(&0x0000u16.to_be_bytes()); // postamble size
    p.extend_from_slice(&ACN_PACKET_ID);
    p.extend_from_slice(&flags_and_length(PACKET_LEN - 16).to_be_bytes());
    p.extend_from_slice(&VECTOR_ROOT_DATA.to_be_bytes());
    p.extend_from_slice(cid);

    // Framing layer.
    p.extend_from_slice(&flags_and_length(PACKET_LEN - 38).to_be_bytes());
    p.extend_from_slice(&VECTOR_FRAMING_DATA.to_be_bytes());
    let mut name = [0u8; 64];
    let bytes = source_name.as_bytes();
    let n = bytes.len().min(63);
    name[..n].copy_from_slice(&bytes[..n]);
    p.extend_from_slice(&name);
    p.push(priority);
    p.extend_from_slice(&0u16.to_be_bytes()); // sync address
    p.push(sequence);
    p.push(0); // options
    p.extend_from_slice(&universe.to_be_bytes());

    // DMP layer.
    p.extend_from_slice(&flags_and_length(PACKET_LEN - 115).to_be_bytes());
    p.push(VECTOR_DMP_SET);
    p.push(0xA1); // address & data type
    p.extend_from_slice(&0u16.to_be_bytes()); // first property address
    p.extend_from_slice(&1u16.to_be_bytes()); // address increment
    p.extend_from_slice(&513u16.to_be_bytes()); // property value count
    p.push(0x00); // DMX start code
    p.extend_from_slice(data);

    p
}

fn flags_and_length(len: usize) -> u16 {
    0x7000 | (len as u16 & 0x0FFF)
}

/// Parse a data packet; returns (universe, sequence, slots).
pub fn parse_data_packet(packet: &[u8]) -> Option<(u16, u8, &[u8])> {
    if packet.len() < 126 {
        return None;
    }
    if packet[4..16] != ACN_PACKET_ID {
        return None;
    }
    let root_vector = u32::from_be_bytes([packet[18], packet[19], packet[20], packet[21]]);
    if root_vector != VECTOR_ROOT_DATA {
        return None;
    }
    let framing_vector = u32::from_be_bytes([packet[40], packet[41], packet[42], packet[43]]);
    if framing_vector != VECTOR_FRAMING_DATA {
        return None;
    }
    if packet[117] != VECTOR_DMP_SET || packet[125] != 0x00 {
        return None;
    }
    let universe = u16::from_be_bytes([packet[113], packet[114]]);
    let sequence = packet[111];
    let count = u16::from_be_bytes([packet[123], packet[124]]) as usize;
    let slots = count.saturating_sub(1).min(512);
    if packet.len() < 126 + slots {
        return None;
    }
    Some((universe, sequence, &packet[126..126 + slots]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_roundtrip() {
        let cid = [7u8; 16];
        let mut data = [0u8; 512];
        data[0] = 255;
        data[511] = 1;
        let packet = encode_data_packet(&cid, "console", 100, 3, 9, &data);
        assert_eq!(packet.len(), PACKET_LEN);

        let (universe, sequence, slots) = parse_data_packet(&packet).unwrap();
        assert_eq!(universe, 3);
        assert_eq!(sequence, 9);
        assert_eq!(slots.len(), 512);
        assert_eq!(slots[0], 255);
        assert_eq!(slots[511], 1);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_data_packet(&[0u8; 10]).is_none());
        assert!(parse_data_packet(&[0u8; 700]).is_none());
    }

    #[test]
    fn multicast_group_from_universe() {
        assert_eq!(multicast_group(1), Ipv4Addr::new(239, 255, 0, 1));
        assert_eq!(multicast_group(256), Ipv4Addr::new(239, 255, 1, 0));
    }
}
