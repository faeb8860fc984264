//! Router error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RouterError>;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error(transparent)]
    Core(#[from] clasp_core::Error),

    #[error(transparent)]
    Transport(#[from] clasp_transport::TransportError),

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("router is shutting down")]
    ShuttingDown,
}
