//! Reactor errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("selector thread pool is shutting down")]
    PoolShutdown,

    #[error("failed to spawn selector thread: {0}")]
    ThreadSpawn(String),

    #[error("protocol context creation failed: {0}")]
    ContextFailed(String),
}
