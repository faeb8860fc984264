//! Transport trait seams
//!
//! Every front-end reduces to the same contract: a cloneable sender, a
//! receiver of [`TransportEvent`]s, and (server-side) an accept loop.
//! The router never sees anything transport-specific past this point.

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;

use crate::error::Result;

/// Events surfaced by a transport connection.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: Option<String> },
    /// One complete CLASP frame.
    Data(Bytes),
    Error(String),
}

#[async_trait]
pub trait TransportSender: Send + Sync {
    /// Queue one frame, waiting for buffer space.
    async fn send(&self, data: Bytes) -> Result<()>;

    /// Queue one frame without waiting; fails when the buffer is full.
    fn try_send(&self, data: Bytes) -> Result<()>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait TransportReceiver: Send {
    /// Next event; `None` when the connection is gone.
    async fn recv(&mut self) -> Option<TransportEvent>;
}

/// A listening front-end.
#[async_trait]
pub trait TransportServer: Send + Sync {
    type Sender: TransportSender;
    type Receiver: TransportReceiver;

    async fn accept(&mut self) -> Result<(Self::Sender, Self::Receiver, SocketAddr)>;

    fn local_addr(&self) -> Result<SocketAddr>;

    async fn close(&self) -> Result<()>;
}
