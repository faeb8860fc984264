//! Bridge error types
//!
//! The supervisor's restart policy keys off [`BridgeError::is_fatal`]:
//! transient faults (socket reset, device unplug) retry with backoff,
//! fatal ones park the bridge in the Error state.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Error, Debug)]
pub enum BridgeError {
    /// Recoverable: retried with exponential backoff.
    #[error("transient fault: {0}")]
    Transient(String),

    /// Unrecoverable: surfaced to the control surface.
    #[error("fatal fault: {0}")]
    Fatal(String),

    #[error("bad bridge config: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unknown bridge kind: {0}")]
    UnknownKind(String),
}

impl BridgeError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::Fatal(_) | BridgeError::Config(_) | BridgeError::UnknownKind(_)
        )
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::Transient(e.to_string())
    }
}
