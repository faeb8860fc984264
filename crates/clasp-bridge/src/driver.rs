//! Bridge driver contract

use crate::error::Result;
use async_trait::async_trait;
use clasp_core::Message;
use serde::Serialize;
use tokio::sync::mpsc;

/// Bridge health, reported to the control surface on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    Starting,
    Running,
    /// Transient fault; the supervisor is backing off before a restart.
    Degraded,
    Stopped,
    /// Fatal fault; stays down until deleted and recreated.
    Error,
}

/// Events a running driver pushes to its supervisor.
#[derive(Debug)]
pub enum DriverEvent {
    /// Foreign wire unit translated into a CLASP message.
    Inbound(Message),
    /// The driver's I/O died; `fatal` decides restart vs park.
    Fault { fatal: bool, detail: String },
}

/// A bi-directional translator between one foreign protocol and the
/// CLASP address space. Drivers own their sockets/devices; the
/// supervisor owns their lifecycle.
#[async_trait]
pub trait BridgeDriver: Send {
    fn kind(&self) -> &'static str;

    /// Address-space prefix this driver writes into and listens on.
    fn namespace(&self) -> &str;

    /// Bring up I/O. The returned channel carries inbound traffic until
    /// the driver faults or is stopped.
    async fn start(&mut self) -> Result<mpsc::Receiver<DriverEvent>>;

    /// One CLASP message addressed inside the namespace, to be put on
    /// the foreign wire.
    async fn outbound(&mut self, message: &Message) -> Result<()>;

    async fn stop(&mut self);
}
