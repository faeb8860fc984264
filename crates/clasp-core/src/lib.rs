//! CLASP Core
//!
//! Protocol primitives for CLASP v2, the Creative Low-Latency Application
//! Streaming Protocol:
//!
//! - typed message set and [`Value`] model ([`types`])
//! - binary frame layout ([`frame`])
//! - both payload encodings with auto-detection ([`codec`])
//! - address parsing and wildcard patterns ([`address`])
//! - capability grants ([`grant`])
//! - microsecond clock helpers ([`time`])

pub mod address;
pub mod codec;
pub mod error;
pub mod frame;
pub mod grant;
pub mod time;
pub mod types;

pub use address::{Address, Pattern};
pub use error::{Error, ErrorCode, Result};
pub use frame::{Frame, FrameFlags};
pub use grant::Grant;
pub use types::*;

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u8 = 2;

/// First byte of every frame ('S').
pub const FRAME_MAGIC: u8 = 0x53;

/// Default router TCP/WebSocket port.
pub const DEFAULT_PORT: u16 = 7330;

/// Default UDP discovery port.
pub const DISCOVERY_PORT: u16 = 7331;

/// WebSocket subprotocol identifier.
pub const WS_SUBPROTOCOL: &str = "clasp.v2";

/// mDNS service type.
pub const MDNS_SERVICE_TYPE: &str = "_clasp._tcp.local.";
