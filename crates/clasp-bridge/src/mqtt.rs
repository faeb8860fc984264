//! MQTT driver
//!
//! Topic paths map one-to-one under the bridge namespace:
//! topic `a/b/c` ↔ `{ns}/a/b/c`. Payloads that parse as JSON become
//! structured values, valid UTF-8 becomes a string, anything else a
//! byte-string.

use crate::driver::{BridgeDriver, DriverEvent};
use crate::error::{BridgeError, Result};
use crate::json::{json_to_value, value_to_json};
use async_trait::async_trait;
use clasp_core::{Message, Publish, Set, Value};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Topic filters to subscribe to.
    pub topics: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "clasp-bridge".to_string(),
            topics: vec!["#".to_string()],
            username: None,
            password: None,
        }
    }
}

pub struct MqttDriver {
    namespace: String,
    config: MqttConfig,
    client: Option<AsyncClient>,
}

impl MqttDriver {
    pub fn new(namespace: &str, config: MqttConfig) -> Self {
        Self {
            namespace: namespace.trim_end_matches('/').to_string(),
            config,
            client: None,
        }
    }
}

#[async_trait]
impl BridgeDriver for MqttDriver {
    fn kind(&self) -> &'static str {
        "mqtt"
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn start(&mut self) -> Result<mpsc::Receiver<DriverEvent>> {
        let mut options =
            MqttOptions::new(&self.config.client_id, &self.config.host, self.config.port);
        options.set_keep_alive(Duration::from_secs(15));
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            options.set_credentials(user, pass);
        }
        let (client, mut eventloop) = AsyncClient::new(options, 64);
        for topic in &self.config.topics {
            client
                .subscribe(topic, QoS::AtMostOnce)
                .await
                .map_err(|e| BridgeError::Transient(format!("mqtt subscribe: {e}")))?;
        }
        info!(host = %self.config.host, port = self.config.port, "mqtt driver connecting");
        self.client = Some(client);

        let (tx, rx) = mpsc::channel(256);
        let namespace = self.namespace.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = Message::Set(Set {
                            address: format!("{namespace}/{}", publish.topic),
                            value: payload_to_value(&publish.payload),
                            revision: None,
                            lock: false,
                            unlock: false,
                        });
                        if tx.send(DriverEvent::Inbound(message)).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = tx
                            .send(DriverEvent::Fault {
                                fatal: false,
                                detail: format!("mqtt connection: {e}"),
                            })
                            .await;
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn outbound(&mut self, message: &Message) -> Result<()> {
        let Some(client) = &self.client else {
            return Ok(());
        };
        let (address, value) = match message {
            Message::Set(set) => (&set.address, Some(&set.value)),
            Message::Publish(Publish {
                address,
                value,
                payload,
                ..
            }) => (address, value.as_ref().or(payload.as_ref())),
            _ => return Ok(()),
        };
        let Some(topic) = address
            .strip_prefix(&self.namespace)
            .and_then(|rest| rest.strip_prefix('/'))
        else {
            return Ok(());
        };
        let body = match value {
            Some(v) => serde_json::to_vec(&value_to_json(v))
                .map_err(|e| BridgeError::Protocol(e.to_string()))?,
            None => Vec::new(),
        };
        client
            .publish(topic, QoS::AtLeastOnce, false, body)
            .await
            .map_err(|e| BridgeError::Transient(format!("mqtt publish: {e}")))?;
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = client.disconnect().await;
        }
        debug!("mqtt driver stopped");
    }
}

fn payload_to_value(payload: &[u8]) -> Value {
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(payload) {
        return json_to_value(&json);
    }
    match std::str::from_utf8(payload) {
        Ok(text) => Value::String(text.to_string()),
        Err(_) => Value::Bytes(payload.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_payloads_become_structured_values() {
        assert_eq!(payload_to_value(b"0.5"), Value::Float(0.5));
        assert_eq!(payload_to_value(b"[1,2]"), Value::Array(vec![Value::Int(1), Value::Int(2)]));
        assert_eq!(payload_to_value(b"true"), Value::Bool(true));
    }

    #[test]
    fn text_payloads_become_strings() {
        assert_eq!(payload_to_value(b"hello there"), Value::String("hello there".into()));
    }

    #[test]
    fn binary_payloads_become_bytes() {
        assert_eq!(payload_to_value(&[0xFF, 0xFE]), Value::Bytes(vec![0xFF, 0xFE]));
    }
}
