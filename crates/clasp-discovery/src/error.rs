//! Discovery error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiscoveryError>;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("mdns: {0}")]
    Mdns(String),

    #[error("network: {0}")]
    Network(String),

    #[error(transparent)]
    Transport(#[from] clasp_transport::TransportError),

    #[error(transparent)]
    Core(#[from] clasp_core::Error),
}
