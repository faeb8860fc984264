//! Daemon configuration
//!
//! Loaded from a JSON or TOML file (picked by extension) and overlaid
//! with command-line flags. Tokens map opaque strings to capability
//! clause lists; bridges listed here are created at startup.

use anyhow::{bail, Context};
use clasp_core::grant::{Grant, TokenBook};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub name: Option<String>,
    /// WebSocket listen address, e.g. "0.0.0.0:7330".
    pub listen: Option<String>,
    /// Optional raw-TCP listener.
    pub tcp: Option<String>,
    /// Optional UDP listener.
    pub udp: Option<String>,
    pub require_token: bool,
    /// Advertise over mDNS and answer UDP probes.
    pub announce: bool,
    /// token string → capability clauses ("read:/a/**;write:/b/**").
    pub tokens: HashMap<String, String>,
    /// Bridges to create at startup.
    pub bridges: Vec<BridgeEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeEntry {
    pub id: String,
    /// Foreign protocol: osc, midi, artnet, dmx, sacn, mqtt, http,
    /// websocket.
    pub source: String,
    #[serde(default)]
    pub source_addr: String,
    /// Namespace prefix inside the router.
    pub target_addr: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl DaemonConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&raw).context("parsing TOML config")?,
            Some("json") => serde_json::from_str(&raw).context("parsing JSON config")?,
            other => bail!("unsupported config extension: {other:?}"),
        };
        Ok(config)
    }

    /// Build the token registry; a malformed clause list is a
    /// configuration error (exit code 1).
    pub fn token_book(&self) -> anyhow::Result<TokenBook> {
        let mut book = TokenBook::new();
        for (token, clauses) in &self.tokens {
            let grant = Grant::parse(clauses)
                .with_context(|| format!("token {token}: bad capability clauses"))?;
            book.insert(token.clone(), grant);
        }
        Ok(book)
    }
}
