//! HTTP driver
//!
//! Two modes. `webhook` POSTs every delivered signal as JSON
//! `{ address, value }` to a configured URL. `server` accepts the same
//! shape on `POST /signal` and injects it into the router.

use crate::driver::{BridgeDriver, DriverEvent};
use crate::error::{BridgeError, Result};
use crate::json::{json_to_value, value_to_json};
use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Json;
use clasp_core::{Message, Publish, Set};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HttpMode {
    #[default]
    Webhook,
    Server,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub mode: HttpMode,
    /// Webhook target.
    pub url: String,
    /// Server bind address.
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            mode: HttpMode::Webhook,
            url: String::new(),
            bind: "0.0.0.0:7340".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SignalBody {
    address: String,
    value: serde_json::Value,
}

pub struct HttpDriver {
    namespace: String,
    config: HttpConfig,
    client: reqwest::Client,
    stop: Option<tokio::sync::watch::Sender<bool>>,
}

impl HttpDriver {
    pub fn new(namespace: &str, config: HttpConfig) -> Self {
        Self {
            namespace: namespace.trim_end_matches('/').to_string(),
            config,
            client: reqwest::Client::new(),
            stop: None,
        }
    }
}

#[async_trait]
impl BridgeDriver for HttpDriver {
    fn kind(&self) -> &'static str {
        "http"
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn start(&mut self) -> Result<mpsc::Receiver<DriverEvent>> {
        let (tx, rx) = mpsc::channel(256);
        if self.config.mode == HttpMode::Server {
            let listener = tokio::net::TcpListener::bind(&self.config.bind)
                .await
                .map_err(|e| BridgeError::Transient(format!("http bind {}: {e}", self.config.bind)))?;
            info!(bind = %self.config.bind, "http driver serving");

            let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
            self.stop = Some(stop_tx);
            let namespace = self.namespace.clone();
            let app = axum::Router::new()
                .route("/signal", post(accept_signal))
                .with_state((tx.clone(), namespace));
            tokio::spawn(async move {
                let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                    let _ = stop_rx.changed().await;
                });
                if let Err(e) = server.await {
                    let _ = tx
                        .send(DriverEvent::Fault {
                            fatal: false,
                            detail: format!("http server: {e}"),
                        })
                        .await;
                }
            });
        } else if self.config.url.is_empty() {
            return Err(BridgeError::Config("webhook mode needs a url".into()));
        } else {
            info!(url = %self.config.url, "http driver posting webhooks");
        }
        Ok(rx)
    }

    async fn outbound(&mut self, message: &Message) -> Result<()> {
        if self.config.mode != HttpMode::Webhook {
            return Ok(());
        }
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
        let body = serde_json::json!({
            "address": address,
            "value": value.map(value_to_json),
        });
        self.client
            .post(&self.config.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BridgeError::Transient(format!("webhook post: {e}")))?;
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
        debug!("http driver stopped");
    }
}

async fn accept_signal(
    State((tx, namespace)): State<(mpsc::Sender<DriverEvent>, String)>,
    Json(body): Json<SignalBody>,
) -> StatusCode {
    let address = if body.address.starts_with('/') {
        format!("{namespace}{}", body.address)
    } else {
        format!("{namespace}/{}", body.address)
    };
    let message = Message::Set(Set {
        address,
        value: json_to_value(&body.value),
        revision: None,
        lock: false,
        unlock: false,
    });
    match tx.send(DriverEvent::Inbound(message)).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
