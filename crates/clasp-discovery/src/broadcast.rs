//! UDP broadcast discovery
//!
//! Fallback for networks without mDNS. Clients broadcast the probe byte
//! sequence to port 7331; each router replies unicast with an ANNOUNCE
//! frame carrying the same keys as its mDNS TXT record.

use crate::{DiscoveryError, Result, RouterIdentity};
use clasp_core::{codec, Announce, Message, Value, DISCOVERY_PORT, PROTOCOL_VERSION};
use clasp_transport::UdpTransport;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

/// Well-known probe bytes. Deliberately not a CLASP frame, so probe
/// traffic can never be mistaken for session traffic.
pub const PROBE: &[u8] = b"CLASP?v2";

/// Answers probes for one router until dropped.
pub struct ProbeResponder {
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl ProbeResponder {
    pub async fn bind(identity: RouterIdentity) -> Result<Self> {
        Self::bind_on(DISCOVERY_PORT, identity).await
    }

    pub async fn bind_on(port: u16, identity: RouterIdentity) -> Result<Self> {
        let transport = UdpTransport::bind(&format!("0.0.0.0:{port}")).await?;
        info!(port, "probe responder listening");
        let (shutdown, mut shutdown_rx) = tokio::sync::watch::channel(false);

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                tokio::select! {
                    received = transport.recv_from(&mut buf) => {
                        let (len, from) = match received {
                            Ok(got) => got,
                            Err(e) => {
                                debug!("probe recv failed: {e}");
                                break;
                            }
                        };
                        if &buf[..len] != PROBE {
                            continue;
                        }
                        debug!(%from, "probe received");
                        if let Ok(reply) = codec::encode(&announce_for(&identity)) {
                            let _ = transport.send_to(&reply, from).await;
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        Ok(Self { shutdown })
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for ProbeResponder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn announce_for(identity: &RouterIdentity) -> Message {
    let mut meta = BTreeMap::new();
    meta.insert("version".to_string(), Value::Int(PROTOCOL_VERSION as i64));
    meta.insert("name".to_string(), Value::String(identity.name.clone()));
    meta.insert("ws".to_string(), Value::Int(identity.ws_port as i64));
    Message::Announce(Announce {
        namespace: "/".to_string(),
        signals: Vec::new(),
        meta: Some(meta),
    })
}

/// One discovered router.
#[derive(Debug, Clone)]
pub struct DiscoveredRouter {
    pub name: String,
    pub ws_port: u16,
    pub from: SocketAddr,
}

/// Broadcast a probe and collect ANNOUNCE replies for `wait`.
pub async fn probe(port: u16, wait: Duration) -> Result<Vec<DiscoveredRouter>> {
    let transport = UdpTransport::bind("0.0.0.0:0").await?;
    transport.set_broadcast(true)?;
    let target: SocketAddr = format!("255.255.255.255:{port}")
        .parse()
        .map_err(|e| DiscoveryError::Network(format!("broadcast addr: {e}")))?;
    transport.send_to(PROBE, target).await?;

    let mut found = Vec::new();
    let deadline = tokio::time::Instant::now() + wait;
    let mut buf = [0u8; 2048];
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, transport.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                if let Ok((Message::Announce(announce), _)) = codec::decode(&buf[..len]) {
                    if let Some(router) = parse_announce(&announce, from) {
                        debug!(name = %router.name, %from, "router discovered");
                        found.push(router);
                    }
                }
            }
            Ok(Err(_)) | Err(_) => break,
        }
    }
    Ok(found)
}

fn parse_announce(announce: &Announce, from: SocketAddr) -> Option<DiscoveredRouter> {
    let meta = announce.meta.as_ref()?;
    Some(DiscoveredRouter {
        name: meta.get("name")?.as_str()?.to_string(),
        ws_port: meta.get("ws")?.as_i64()? as u16,
        from,
    })
}
