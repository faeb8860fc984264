//! CLASP protocol bridges
//!
//! Bi-directional translators between foreign protocols and the CLASP
//! address space, run under a supervised runtime:
//!
//! - OSC, MIDI, Art-Net, DMX-512, sACN/E1.31 (creative/lighting wire)
//! - MQTT, HTTP, generic WebSocket (app plumbing)
//!
//! Every bridge attaches to the router as a pseudo-session and speaks
//! ordinary CLASP messages; the drivers only translate.

pub mod driver;
pub mod error;
pub mod json;
pub mod runtime;

#[cfg(feature = "osc")]
pub mod osc;

#[cfg(feature = "midi")]
pub mod midi;

#[cfg(feature = "artnet")]
pub mod artnet;

#[cfg(feature = "dmx")]
pub mod dmx;

#[cfg(feature = "sacn")]
pub mod sacn;

#[cfg(feature = "mqtt")]
pub mod mqtt;

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use driver::{BridgeDriver, BridgeState, DriverEvent};
pub use error::{BridgeError, Result};
pub use runtime::{BridgeEvent, BridgeInfo, BridgeRuntime, BridgeSpec};

use serde::de::DeserializeOwned;

fn parse_config<T: DeserializeOwned + Default>(value: &serde_json::Value) -> Result<T> {
    if value.is_null() {
        Ok(T::default())
    } else {
        serde_json::from_value(value.clone()).map_err(|e| BridgeError::Config(e.to_string()))
    }
}

/// Instantiate a driver for a create-bridge request.
pub fn build_driver(spec: &BridgeSpec) -> Result<Box<dyn BridgeDriver>> {
    let namespace = spec.target_addr.as_str();
    match spec.kind.as_str() {
        #[cfg(feature = "osc")]
        "osc" => {
            let mut config: osc::OscConfig = parse_config(&spec.config)?;
            if !spec.source_addr.is_empty() {
                config.bind = spec.source_addr.clone();
            }
            Ok(Box::new(osc::OscDriver::new(namespace, config)))
        }
        #[cfg(feature = "midi")]
        "midi" => {
            let mut config: midi::MidiConfig = parse_config(&spec.config)?;
            if !spec.source_addr.is_empty() {
                config.input_port = Some(spec.source_addr.clone());
            }
            Ok(Box::new(midi::MidiDriver::new(namespace, config)))
        }
        #[cfg(feature = "artnet")]
        "artnet" => {
            let mut config: artnet::ArtnetConfig = parse_config(&spec.config)?;
            if !spec.source_addr.is_empty() {
                config.bind = spec.source_addr.clone();
            }
            Ok(Box::new(artnet::ArtnetDriver::new(namespace, config)))
        }
        #[cfg(feature = "dmx")]
        "dmx" => {
            let mut config: dmx::DmxConfig = parse_config(&spec.config)?;
            if !spec.source_addr.is_empty() {
                config.port = spec.source_addr.clone();
            }
            Ok(Box::new(dmx::DmxDriver::new(namespace, config)))
        }
        #[cfg(feature = "sacn")]
        "sacn" => {
            let config: sacn::SacnConfig = parse_config(&spec.config)?;
            Ok(Box::new(sacn::SacnDriver::new(namespace, config)))
        }
        #[cfg(feature = "mqtt")]
        "mqtt" => {
            let mut config: mqtt::MqttConfig = parse_config(&spec.config)?;
            if !spec.source_addr.is_empty() {
                config.host = spec.source_addr.clone();
            }
            Ok(Box::new(mqtt::MqttDriver::new(namespace, config)))
        }
        #[cfg(feature = "http")]
        "http" => {
            let mut config: http::HttpConfig = parse_config(&spec.config)?;
            if !spec.source_addr.is_empty() {
                config.url = spec.source_addr.clone();
            }
            Ok(Box::new(http::HttpDriver::new(namespace, config)))
        }
        #[cfg(feature = "websocket")]
        "websocket" => {
            let mut config: websocket::WsBridgeConfig = parse_config(&spec.config)?;
            if !spec.source_addr.is_empty() {
                config.url = spec.source_addr.clone();
            }
            Ok(Box::new(websocket::WsBridgeDriver::new(namespace, config)))
        }
        other => Err(BridgeError::UnknownKind(other.to_string())),
    }
}
