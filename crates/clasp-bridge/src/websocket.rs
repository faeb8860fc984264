//! Generic WebSocket driver
//!
//! Connects out to an arbitrary WebSocket endpoint and exchanges JSON
//! text messages of the shape `{ "address": "/x", "value": ... }`.
//! Useful for web apps that speak plain JSON rather than CLASP frames.

use crate::driver::{BridgeDriver, DriverEvent};
use crate::error::{BridgeError, Result};
use crate::json::{json_to_value, value_to_json};
use async_trait::async_trait;
use clasp_core::{Message, Publish, Set};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WsBridgeConfig {
    /// Endpoint to connect to, e.g. `ws://host:port/path`.
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct WireSignal {
    address: String,
    #[serde(default)]
    value: serde_json::Value,
}

pub struct WsBridgeDriver {
    namespace: String,
    config: WsBridgeConfig,
    out_tx: Option<mpsc::Sender<WsMessage>>,
}

impl WsBridgeDriver {
    pub fn new(namespace: &str, config: WsBridgeConfig) -> Self {
        Self {
            namespace: namespace.trim_end_matches('/').to_string(),
            config,
            out_tx: None,
        }
    }
}

#[async_trait]
impl BridgeDriver for WsBridgeDriver {
    fn kind(&self) -> &'static str {
        "websocket"
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn start(&mut self) -> Result<mpsc::Receiver<DriverEvent>> {
        if self.config.url.is_empty() {
            return Err(BridgeError::Config("websocket bridge needs a url".into()));
        }
        let (stream, _response) = tokio_tungstenite::connect_async(&self.config.url)
            .await
            .map_err(|e| BridgeError::Transient(format!("ws connect {}: {e}", self.config.url)))?;
        info!(url = %self.config.url, "websocket driver connected");
        let (mut write, mut read) = stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<WsMessage>(128);
        self.out_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let (tx, rx) = mpsc::channel(256);
        let namespace = self.namespace.clone();
        tokio::spawn(async move {
            while let Some(result) = read.next().await {
                match result {
                    Ok(WsMessage::Text(text)) => {
                        let Ok(signal) = serde_json::from_str::<WireSignal>(&text) else {
                            debug!("unparseable ws signal: {text}");
                            continue;
                        };
                        let message = Message::Set(Set {
                            address: format!("{namespace}{}", signal.address),
                            value: json_to_value(&signal.value),
                            revision: None,
                            lock: false,
                            unlock: false,
                        });
                        if tx.send(DriverEvent::Inbound(message)).await.is_err() {
                            return;
                        }
                    }
                    Ok(WsMessage::Close(_)) => {
                        let _ = tx
                            .send(DriverEvent::Fault {
                                fatal: false,
                                detail: "peer closed".into(),
                            })
                            .await;
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = tx
                            .send(DriverEvent::Fault {
                                fatal: false,
                                detail: e.to_string(),
                            })
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn outbound(&mut self, message: &Message) -> Result<()> {
        let Some(out_tx) = &self.out_tx else {
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
        let Some(rest) = address.strip_prefix(&self.namespace) else {
            return Ok(());
        };
        let body = serde_json::json!({
            "address": rest,
            "value": value.map(value_to_json),
        });
        out_tx
            .send(WsMessage::Text(body.to_string()))
            .await
            .map_err(|e| BridgeError::Transient(e.to_string()))?;
        Ok(())
    }

    async fn stop(&mut self) {
        self.out_tx = None;
    }
}
