//! MIDI driver
//!
//! Mapping:
//! - control change on channel C, controller N, device D →
//!   Param `{ns}/{D}/cc/{C}/{N}`, 0–127
//! - note on/off → Event `{ns}/{D}/note/{C}` with `{note, velocity, phase}`
//! - pitch bend → Param `{ns}/{D}/pb/{C}`, −8192..8191
//!
//! midir hands callbacks out on its own thread; the driver shuttles
//! them into the async world over channels and keeps the connections
//! alive on dedicated threads.

use crate::driver::{BridgeDriver, DriverEvent};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use clasp_core::{Message, Publish, Set, SignalKind, Value};
use midir::{MidiInput, MidiOutput};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MidiConfig {
    /// Input port name substring; first available when unset.
    pub input_port: Option<String>,
    pub output_port: Option<String>,
    /// Device segment used in addresses.
    pub device: String,
}

impl Default for MidiConfig {
    fn default() -> Self {
        Self {
            input_port: None,
            output_port: None,
            device: "default".to_string(),
        }
    }
}

pub struct MidiDriver {
    namespace: String,
    config: MidiConfig,
    out_tx: Option<std::sync::mpsc::Sender<Vec<u8>>>,
    running: Arc<AtomicBool>,
}

impl MidiDriver {
    pub fn new(namespace: &str, config: MidiConfig) -> Self {
        Self {
            namespace: namespace.trim_end_matches('/').to_string(),
            config,
            out_tx: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn list_input_ports() -> Result<Vec<String>> {
        let input = MidiInput::new("clasp-midi-scan")
            .map_err(|e| BridgeError::Transient(e.to_string()))?;
        Ok(input
            .ports()
            .iter()
            .filter_map(|p| input.port_name(p).ok())
            .collect())
    }
}

#[async_trait]
impl BridgeDriver for MidiDriver {
    fn kind(&self) -> &'static str {
        "midi"
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn start(&mut self) -> Result<mpsc::Receiver<DriverEvent>> {
        let (tx, rx) = mpsc::channel(256);
        self.running.store(true, Ordering::Relaxed);

        // Input side.
        let input = MidiInput::new("clasp-midi-in")
            .map_err(|e| BridgeError::Transient(e.to_string()))?;
        let wanted = self.config.input_port.clone();
        let port = input
            .ports()
            .into_iter()
            .find(|p| match (&wanted, input.port_name(p)) {
                (Some(name), Ok(n)) => n.contains(name.as_str()),
                (None, Ok(_)) => true,
                _ => false,
            })
            .ok_or_else(|| BridgeError::Transient("no matching midi input port".into()))?;

        let namespace = self.namespace.clone();
        let device = self.config.device.clone();
        let running = self.running.clone();
        let event_tx = tx.clone();
        std::thread::spawn(move || {
            let connection = input.connect(
                &port,
                "clasp-midi-in",
                move |_stamp, data, _| {
                    if let Some(message) = midi_to_message(&namespace, &device, data) {
                        // Lossy on overload; MIDI floods shouldn't stall
                        // the device thread.
                        let _ = event_tx.try_send(DriverEvent::Inbound(message));
                    }
                },
                (),
            );
            match connection {
                Ok(_connection) => {
                    while running.load(Ordering::Relaxed) {
                        std::thread::sleep(std::time::Duration::from_millis(100));
                    }
                    // _connection drops here, closing the port.
                }
                Err(e) => {
                    warn!("midi input connect failed: {e}");
                }
            }
        });

        // Output side, when a port is configured or available.
        let output = MidiOutput::new("clasp-midi-out")
            .map_err(|e| BridgeError::Transient(e.to_string()))?;
        let wanted_out = self.config.output_port.clone();
        let out_port = output.ports().into_iter().find(|p| {
            match (&wanted_out, output.port_name(p)) {
                (Some(name), Ok(n)) => n.contains(name.as_str()),
                (None, Ok(_)) => true,
                _ => false,
            }
        });
        if let Some(out_port) = out_port {
            let (out_tx, out_rx) = std::sync::mpsc::channel::<Vec<u8>>();
            self.out_tx = Some(out_tx);
            std::thread::spawn(move || {
                match output.connect(&out_port, "clasp-midi-out") {
                    Ok(mut connection) => {
                        while let Ok(bytes) = out_rx.recv() {
                            if let Err(e) = connection.send(&bytes) {
                                warn!("midi send failed: {e}");
                            }
                        }
                    }
                    Err(e) => warn!("midi output connect failed: {e}"),
                }
            });
        } else {
            debug!("no midi output port; bridge is input-only");
        }

        info!(device = %self.config.device, "midi driver started");
        Ok(rx)
    }

    async fn outbound(&mut self, message: &Message) -> Result<()> {
        let Some(out_tx) = &self.out_tx else {
            return Ok(());
        };
        if let Some(bytes) = message_to_midi(&self.namespace, &self.config.device, message) {
            out_tx
                .send(bytes)
                .map_err(|e| BridgeError::Transient(e.to_string()))?;
        }
        Ok(())
    }

    async fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        self.out_tx = None;
    }
}

/// Raw MIDI bytes → CLASP message, or `None` for unmapped statuses.
pub fn midi_to_message(namespace: &str, device: &str, data: &[u8]) -> Option<Message> {
    if data.len() < 3 {
        return None;
    }
    let status = data[0] & 0xF0;
    let channel = data[0] & 0x0F;
    match status {
        0xB0 => Some(Message::Set(Set {
            address: format!("{namespace}/{device}/cc/{channel}/{}", data[1]),
            value: Value::Int(data[2] as i64),
            revision: None,
            lock: false,
            unlock: false,
        })),
        0x90 | 0x80 => {
            let on = status == 0x90 && data[2] > 0;
            let mut payload = BTreeMap::new();
            payload.insert("note".to_string(), Value::Int(data[1] as i64));
            payload.insert("velocity".to_string(), Value::Int(data[2] as i64));
            payload.insert(
                "phase".to_string(),
                Value::String(if on { "on" } else { "off" }.to_string()),
            );
            Some(Message::Publish(Publish {
                address: format!("{namespace}/{device}/note/{channel}"),
                signal: Some(SignalKind::Event),
                value: None,
                payload: Some(Value::Map(payload)),
                samples: None,
                rate: None,
                id: None,
                phase: None,
                timestamp: None,
            }))
        }
        0xE0 => {
            let raw = ((data[2] as i64) << 7) | data[1] as i64;
            Some(Message::Set(Set {
                address: format!("{namespace}/{device}/pb/{channel}"),
                value: Value::Int(raw - 8192),
                revision: None,
                lock: false,
                unlock: false,
            }))
        }
        _ => None,
    }
}

/// CLASP message → raw MIDI bytes, or `None` when it doesn't map onto
/// this driver's device.
pub fn message_to_midi(namespace: &str, device: &str, message: &Message) -> Option<Vec<u8>> {
    match message {
        Message::Set(set) => {
            let rest = set.address.strip_prefix(namespace)?.strip_prefix('/')?;
            let mut parts = rest.split('/');
            if parts.next()? != device {
                return None;
            }
            match parts.next()? {
                "cc" => {
                    let channel: u8 = parts.next()?.parse().ok()?;
                    let controller: u8 = parts.next()?.parse().ok()?;
                    let value = set.value.as_i64()?.clamp(0, 127) as u8;
                    Some(vec![0xB0 | (channel & 0x0F), controller & 0x7F, value])
                }
                "pb" => {
                    let channel: u8 = parts.next()?.parse().ok()?;
                    let raw = (set.value.as_i64()?.clamp(-8192, 8191) + 8192) as u16;
                    Some(vec![
                        0xE0 | (channel & 0x0F),
                        (raw & 0x7F) as u8,
                        (raw >> 7) as u8,
                    ])
                }
                _ => None,
            }
        }
        Message::Publish(publish) => {
            let rest = publish.address.strip_prefix(namespace)?.strip_prefix('/')?;
            let mut parts = rest.split('/');
            if parts.next()? != device || parts.next()? != "note" {
                return None;
            }
            let channel: u8 = parts.next()?.parse().ok()?;
            let map = match publish.payload.as_ref()? {
                Value::Map(map) => map,
                _ => return None,
            };
            let note = map.get("note")?.as_i64()?.clamp(0, 127) as u8;
            let velocity = map.get("velocity")?.as_i64()?.clamp(0, 127) as u8;
            let on = map.get("phase")?.as_str()? == "on";
            let status = if on { 0x90 } else { 0x80 };
            Some(vec![status | (channel & 0x0F), note, velocity])
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cc_maps_to_param() {
        let msg = midi_to_message("/midi", "launchpad", &[0xB2, 74, 100]).unwrap();
        match msg {
            Message::Set(set) => {
                assert_eq!(set.address, "/midi/launchpad/cc/2/74");
                assert_eq!(set.value, Value::Int(100));
            }
            other => panic!("expected SET, got {other:?}"),
        }
    }

    #[test]
    fn note_on_maps_to_event() {
        let msg = midi_to_message("/midi", "pad", &[0x91, 60, 90]).unwrap();
        match msg {
            Message::Publish(publish) => {
                assert_eq!(publish.address, "/midi/pad/note/1");
                assert_eq!(publish.signal, Some(SignalKind::Event));
                match publish.payload.unwrap() {
                    Value::Map(map) => {
                        assert_eq!(map["note"], Value::Int(60));
                        assert_eq!(map["velocity"], Value::Int(90));
                        assert_eq!(map["phase"], Value::String("on".into()));
                    }
                    other => panic!("expected map payload, got {other:?}"),
                }
            }
            other => panic!("expected PUBLISH, got {other:?}"),
        }
    }

    #[test]
    fn note_on_with_zero_velocity_is_off() {
        let msg = midi_to_message("/midi", "pad", &[0x90, 60, 0]).unwrap();
        match msg {
            Message::Publish(publish) => match publish.payload.unwrap() {
                Value::Map(map) => assert_eq!(map["phase"], Value::String("off".into())),
                other => panic!("expected map, got {other:?}"),
            },
            other => panic!("expected PUBLISH, got {other:?}"),
        }
    }

    #[test]
    fn pitch_bend_is_centered() {
        // Center position: lsb 0, msb 64 → 8192 raw → 0.
        let msg = midi_to_message("/midi", "kb", &[0xE0, 0x00, 0x40]).unwrap();
        match msg {
            Message::Set(set) => {
                assert_eq!(set.address, "/midi/kb/pb/0");
                assert_eq!(set.value, Value::Int(0));
            }
            other => panic!("expected SET, got {other:?}"),
        }
        // Extremes.
        match midi_to_message("/midi", "kb", &[0xE0, 0x00, 0x00]).unwrap() {
            Message::Set(set) => assert_eq!(set.value, Value::Int(-8192)),
            other => panic!("expected SET, got {other:?}"),
        }
        match midi_to_message("/midi", "kb", &[0xE0, 0x7F, 0x7F]).unwrap() {
            Message::Set(set) => assert_eq!(set.value, Value::Int(8191)),
            other => panic!("expected SET, got {other:?}"),
        }
    }

    #[test]
    fn outbound_roundtrips() {
        for bytes in [
            vec![0xB2u8, 74, 100],
            vec![0xE0, 0x12, 0x34],
            vec![0x91, 60, 90],
            vec![0x80, 60, 0],
        ] {
            let msg = midi_to_message("/midi", "dev", &bytes).unwrap();
            let back = message_to_midi("/midi", "dev", &msg).unwrap();
            assert_eq!(back, bytes, "roundtrip of {bytes:?}");
        }
    }

    #[test]
    fn other_devices_are_ignored_outbound() {
        let msg = midi_to_message("/midi", "a", &[0xB0, 1, 2]).unwrap();
        assert!(message_to_midi("/midi", "b", &msg).is_none());
    }
}
