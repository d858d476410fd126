use std::io;

use portside_reactor::ReactorError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForwardingError {
    #[error("port {port} on {address} is already forwarded")]
    PortInUse { address: String, port: u16 },

    #[error("failed to bind {address}:{port}: {source}")]
    Bind {
        address: String,
        port: u16,
        source: io::Error,
    },

    #[error("forwarding factory failed: {0}")]
    FactoryFailed(String),

    #[error("forward {key} is owned by another connection")]
    NotOwner { key: String },

    #[error(transparent)]
    Reactor(#[from] ReactorError),
}
