//! Port forwarding on top of the portside reactor
//!
//! A [`ForwardingManager`] tracks which connection owns which forwarded
//! `address:port`; a [`ForwardingFactory`] binds the listener and an
//! acceptor turns each tunnel client into a logical channel over the
//! owning connection, bridged by a [`TunnelEngine`].

pub mod acceptor;
pub mod engine;
pub mod error;
pub mod factory;
pub mod manager;
pub mod tunnels;

pub use acceptor::TunnelAcceptor;
pub use engine::{TunnelEngine, TunnelOutbound};
pub use error::ForwardingError;
pub use factory::{ForwardingFactory, TcpForwardingFactory};
pub use manager::ForwardingManager;
pub use tunnels::ActiveTunnelManager;
