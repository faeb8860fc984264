//! CLASP transport front-ends
//!
//! All transports hand the router the same thing: complete frames over
//! the [`TransportSender`]/[`TransportReceiver`] seam. WebSocket is the
//! mandatory front-end; TCP, UDP and QUIC are optional features; the
//! loopback transport attaches in-process peers (bridges, tests).

pub mod error;
pub mod loopback;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "tcp")]
pub mod tcp;

#[cfg(feature = "udp")]
pub mod udp;

#[cfg(feature = "quic")]
pub mod quic;

pub use error::{Result, TransportError};
pub use loopback::{LoopbackReceiver, LoopbackSender};
pub use traits::{TransportEvent, TransportReceiver, TransportSender, TransportServer};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketServer, WsReceiver, WsSender};

#[cfg(feature = "tcp")]
pub use tcp::{TcpReceiver, TcpSender, TcpServer};

#[cfg(feature = "udp")]
pub use udp::{UdpReceiver, UdpSender, UdpServer, UdpTransport};

#[cfg(feature = "quic")]
pub use quic::{QuicReceiver, QuicSender, QuicServer};
