//! DMX-512 driver (USB serial interfaces)
//!
//! Output-oriented: SETs on `{ns}/{universe}/{1..512}` update a frame
//! buffer that a refresh loop serializes to the interface at a fixed
//! rate (44 Hz by default) regardless of how fast the CLASP side
//! writes. Packets use the ENTTEC DMX USB Pro framing.

use crate::driver::{BridgeDriver, DriverEvent};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use clasp_core::{Message, Set};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info};

const ENTTEC_START: u8 = 0x7E;
const ENTTEC_END: u8 = 0xE7;
const ENTTEC_SEND_DMX: u8 = 0x06;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DmxConfig {
    /// Serial device path, e.g. `/dev/ttyUSB0`.
    pub port: String,
    pub baud_rate: u32,
    pub universe: u16,
    pub refresh_hz: f64,
}

impl Default for DmxConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 57_600,
            universe: 0,
            refresh_hz: 44.0,
        }
    }
}

pub struct DmxDriver {
    namespace: String,
    config: DmxConfig,
    frame: Arc<Mutex<[u8; 512]>>,
    stop: Option<tokio::sync::watch::Sender<bool>>,
}

impl DmxDriver {
    pub fn new(namespace: &str, config: DmxConfig) -> Self {
        Self {
            namespace: namespace.trim_end_matches('/').to_string(),
            config,
            frame: Arc::new(Mutex::new([0u8; 512])),
            stop: None,
        }
    }
}

#[async_trait]
impl BridgeDriver for DmxDriver {
    fn kind(&self) -> &'static str {
        "dmx"
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn start(&mut self) -> Result<mpsc::Receiver<DriverEvent>> {
        if self.config.port.is_empty() {
            return Err(BridgeError::Config("dmx bridge needs a serial port".into()));
        }
        let mut serial = tokio_serial::new(&self.config.port, self.config.baud_rate)
            .open_native_async()
            .map_err(|e| BridgeError::Transient(format!("serial open {}: {e}", self.config.port)))?;
        info!(port = %self.config.port, hz = self.config.refresh_hz, "dmx driver started");

        let (tx, rx) = mpsc::channel(8);
        let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
        self.stop = Some(stop_tx);
        let frame = self.frame.clone();
        let period = std::time::Duration::from_secs_f64(1.0 / self.config.refresh_hz.max(1.0));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let packet = enttec_packet(&frame.lock());
                        if let Err(e) = serial.write_all(&packet).await {
                            let _ = tx.send(DriverEvent::Fault {
                                fatal: false,
                                detail: format!("serial write: {e}"),
                            }).await;
                            break;
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
        });

        Ok(rx)
    }

    async fn outbound(&mut self, message: &Message) -> Result<()> {
        if let Some((universe, slot, value)) = parse_slot(&self.namespace, message) {
            if universe == self.config.universe {
                self.frame.lock()[(slot - 1) as usize] = value;
            } else {
                debug!(universe, "dmx set for a universe this interface doesn't drive");
            }
        }
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
    }
}

/// `{ns}/{universe}/{slot}` → (universe, slot, value).
fn parse_slot(namespace: &str, message: &Message) -> Option<(u16, u16, u8)> {
    let (address, value) = match message {
        Message::Set(Set { address, value, .. }) => (address, value),
        _ => return None,
    };
    let rest = address.strip_prefix(namespace)?.strip_prefix('/')?;
    let mut parts = rest.split('/');
    let universe: u16 = parts.next()?.parse().ok()?;
    let slot: u16 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || !(1..=512).contains(&slot) {
        return None;
    }
    Some((universe, slot, value.as_i64()?.clamp(0, 255) as u8))
}

/// ENTTEC "send DMX" packet: start, label, LE length, start code, data,
/// end.
fn enttec_packet(frame: &[u8; 512]) -> Vec<u8> {
    let len = (frame.len() + 1) as u16; // plus DMX start code
    let mut packet = Vec::with_capacity(frame.len() + 6);
    packet.push(ENTTEC_START);
    packet.push(ENTTEC_SEND_DMX);
    packet.extend_from_slice(&len.to_le_bytes());
    packet.push(0x00); // DMX start code
    packet.extend_from_slice(frame);
    packet.push(ENTTEC_END);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use clasp_core::Value;

    fn set(addr: &str, v: i64) -> Message {
        Message::Set(Set {
            address: addr.into(),
            value: Value::Int(v),
            revision: None,
            lock: false,
            unlock: false,
        })
    }

    #[test]
    fn slot_parsing() {
        assert_eq!(parse_slot("/dmx", &set("/dmx/0/1", 255)), Some((0, 1, 255)));
        assert_eq!(parse_slot("/dmx", &set("/dmx/2/512", 10)), Some((2, 512, 10)));
        assert_eq!(parse_slot("/dmx", &set("/dmx/0/0", 1)), None);
        assert_eq!(parse_slot("/dmx", &set("/dmx/0/513", 1)), None);
        // Values clamp into DMX range.
        assert_eq!(parse_slot("/dmx", &set("/dmx/0/1", 999)), Some((0, 1, 255)));
    }

    #[test]
    fn enttec_framing() {
        let mut frame = [0u8; 512];
        frame[0] = 0xAA;
        let packet = enttec_packet(&frame);
        assert_eq!(packet.len(), 512 + 6);
        assert_eq!(packet[0], ENTTEC_START);
        assert_eq!(packet[1], ENTTEC_SEND_DMX);
        assert_eq!(u16::from_le_bytes([packet[2], packet[3]]), 513);
        assert_eq!(packet[4], 0x00);
        assert_eq!(packet[5], 0xAA);
        assert_eq!(*packet.last().unwrap(), ENTTEC_END);
    }
}
