//! Outbound connections
//!
//! Starts a non-blocking connect and hands the in-flight stream to the
//! pool. The engine hears `on_socket_connect` (or `on_socket_close` on
//! failure) once the selector observes the outcome; protocol code layers
//! its own acknowledgement, typically a
//! [`ConnectRequestFuture`](portside_core::ConnectRequestFuture), on top
//! of those callbacks.

use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::TcpStream;
use tracing::debug;

use crate::connection_handler::ConnectionHandler;
use crate::context::{DaemonContext, ProtocolContext};
use crate::error::ReactorError;
use crate::pool::{ChannelHandle, SelectorThreadPool};

pub fn connect(
    pool: &SelectorThreadPool,
    daemon: &DaemonContext,
    address: SocketAddr,
    context: &dyn ProtocolContext,
) -> Result<ChannelHandle, ReactorError> {
    let stream = TcpStream::connect(address)?;
    let handler = ConnectionHandler::connecting(
        stream,
        context.create_engine(),
        daemon.executor.clone(),
    );
    handler.apply_options(context.socket_options())?;
    let handle = pool.register_channel(Box::new(handler))?;
    debug!("outbound connect to {} started", address);
    Ok(handle)
}

/// Convenience wrapper for `Arc`-held contexts.
pub fn connect_with(
    pool: &SelectorThreadPool,
    daemon: &DaemonContext,
    address: SocketAddr,
    context: &Arc<dyn ProtocolContext>,
) -> Result<ChannelHandle, ReactorError> {
    connect(pool, daemon, address, context.as_ref())
}
