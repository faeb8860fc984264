//! mDNS advertisement and browsing
//!
//! Service type `_clasp._tcp.local` with TXT keys `version`, `name`,
//! `ws` (the WebSocket port).

use crate::{DiscoveryError, Result, RouterIdentity};
use clasp_core::{DEFAULT_PORT, MDNS_SERVICE_TYPE, PROTOCOL_VERSION};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tracing::{debug, info, warn};

/// Advertises one router for as long as it lives.
pub struct MdnsAdvertiser {
    daemon: ServiceDaemon,
    fullname: Option<String>,
}

impl MdnsAdvertiser {
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::Mdns(e.to_string()))?;
        Ok(Self {
            daemon,
            fullname: None,
        })
    }

    pub fn advertise(&mut self, identity: &RouterIdentity) -> Result<()> {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "clasp-router".to_string());
        let version = PROTOCOL_VERSION.to_string();
        let ws = identity.ws_port.to_string();
        let properties: &[(&str, &str)] = &[
            ("version", version.as_str()),
            ("name", identity.name.as_str()),
            ("ws", ws.as_str()),
        ];
        let info = ServiceInfo::new(
            MDNS_SERVICE_TYPE,
            &identity.name,
            &format!("{host}.local."),
            "",
            identity.ws_port,
            properties,
        )
        .map_err(|e| DiscoveryError::Mdns(e.to_string()))?;

        self.fullname = Some(info.get_fullname().to_string());
        self.daemon
            .register(info)
            .map_err(|e| DiscoveryError::Mdns(e.to_string()))?;
        info!(name = %identity.name, port = identity.ws_port, "mdns advertisement up");
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(fullname) = self.fullname.take() {
            if let Err(e) = self.daemon.unregister(&fullname) {
                warn!("mdns unregister failed: {e}");
            }
        }
    }
}

impl Drop for MdnsAdvertiser {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A router found by browsing.
#[derive(Debug, Clone)]
pub struct MdnsRouter {
    pub name: String,
    pub host: String,
    pub ws_port: u16,
}

/// Browse for routers, forwarding finds until the channel closes.
pub async fn browse(tx: tokio::sync::mpsc::Sender<MdnsRouter>) -> Result<()> {
    let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::Mdns(e.to_string()))?;
    let receiver = daemon
        .browse(MDNS_SERVICE_TYPE)
        .map_err(|e| DiscoveryError::Mdns(e.to_string()))?;
    info!("browsing for {MDNS_SERVICE_TYPE}");

    loop {
        match receiver.recv_async().await {
            Ok(ServiceEvent::ServiceResolved(info)) => {
                let properties = info.get_properties();
                let name = properties
                    .get("name")
                    .and_then(|p| p.val())
                    .map(|v| String::from_utf8_lossy(v).into_owned())
                    .unwrap_or_else(|| info.get_fullname().to_string());
                let ws_port = properties
                    .get("ws")
                    .and_then(|p| p.val())
                    .and_then(|v| String::from_utf8_lossy(v).parse().ok())
                    .unwrap_or(DEFAULT_PORT);
                let router = MdnsRouter {
                    name,
                    host: info.get_hostname().trim_end_matches('.').to_string(),
                    ws_port,
                };
                debug!(?router, "mdns resolved");
                if tx.send(router).await.is_err() {
                    break;
                }
            }
            Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                debug!(%fullname, "mdns service removed");
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mdns browse ended: {e}");
                break;
            }
        }
    }
    Ok(())
}
