//! CLASP discovery
//!
//! Two thin, optional mechanisms with no effect on routing:
//! - mDNS advertisement of `_clasp._tcp.local` with TXT keys `version`,
//!   `name`, `ws`
//! - a UDP probe responder on port 7331 answering a well-known byte
//!   sequence with a unicast ANNOUNCE

pub mod error;

#[cfg(feature = "mdns")]
pub mod mdns;

#[cfg(feature = "broadcast")]
pub mod broadcast;

pub use error::{DiscoveryError, Result};

#[cfg(feature = "mdns")]
pub use mdns::MdnsAdvertiser;

#[cfg(feature = "broadcast")]
pub use broadcast::{probe, ProbeResponder, PROBE};

/// What a router says about itself over either mechanism.
#[derive(Debug, Clone)]
pub struct RouterIdentity {
    pub name: String,
    /// WebSocket port clients should dial.
    pub ws_port: u16,
}
