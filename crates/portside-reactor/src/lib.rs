//! Non-blocking I/O reactor
//!
//! A bounded pool of selector threads drives many socket connections. Each
//! accepted or connected socket is wrapped in a [`SocketHandler`] that
//! feeds a pluggable per-connection [`ProtocolEngine`]; the engines express
//! write-interest back to the reactor, and blocking work is pushed off the
//! reactor threads through the [`Executor`].

pub mod acceptor;
pub mod client;
pub mod connection_handler;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod handler;
pub mod interface;
pub mod pool;
pub mod thread;

pub use acceptor::{bind_interface, AcceptHandler};
pub use client::{connect, connect_with};
pub use connection_handler::ConnectionHandler;
pub use context::{
    DaemonContext, ProtocolContext, ProtocolContextFactory, SocketOptions, StaticContextFactory,
};
pub use engine::{ProtocolEngine, SocketInfo, WriteCompletion};
pub use error::ReactorError;
pub use executor::Executor;
pub use handler::{SocketHandler, Task};
pub use interface::ListeningInterface;
pub use pool::{ChannelHandle, SelectorThreadPool, SelectorThreadPoolConfig};
