//! Protocol context and factory contracts
//!
//! A `ProtocolContext` is an immutable bag of socket tuning options plus
//! the factory method producing a fresh engine per connection. A
//! `ProtocolContextFactory` is attached to a listening interface and
//! invoked once per accepted connection, so different listeners can hand
//! out different contexts (distinct host keys per port, for example).

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use portside_core::EventService;
use socket2::SockRef;

use crate::engine::ProtocolEngine;
use crate::error::ReactorError;
use crate::executor::Executor;

/// Socket tuning applied at bind and accept time.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub keepalive: bool,
    pub tcp_nodelay: bool,
    pub reuse_address: bool,
    pub send_buffer_size: Option<usize>,
    pub recv_buffer_size: Option<usize>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            keepalive: true,
            tcp_nodelay: true,
            reuse_address: true,
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }
}

impl SocketOptions {
    /// Apply the per-stream options. `reuse_address` is a bind-time
    /// option and is handled by the listening interface instead.
    pub fn apply(&self, socket: &SockRef<'_>) -> io::Result<()> {
        socket.set_keepalive(self.keepalive)?;
        socket.set_nodelay(self.tcp_nodelay)?;
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        Ok(())
    }
}

/// Explicit handle bundle passed to components instead of ambient
/// globals: the process-wide event service and the blocking-work executor.
pub struct DaemonContext {
    pub events: Arc<EventService>,
    pub executor: Arc<Executor>,
}

impl DaemonContext {
    pub fn new(events: Arc<EventService>, executor: Arc<Executor>) -> Self {
        Self { events, executor }
    }
}

/// Per-listener configuration: socket options plus the engine factory.
/// Immutable after construction; one context may serve many listening
/// interfaces.
pub trait ProtocolContext: Send + Sync {
    fn socket_options(&self) -> &SocketOptions;

    fn create_engine(&self) -> Box<dyn ProtocolEngine>;
}

/// Produces a context for each accepted connection.
pub trait ProtocolContextFactory: Send + Sync {
    fn create_context(
        &self,
        daemon: &DaemonContext,
        peer: SocketAddr,
    ) -> Result<Arc<dyn ProtocolContext>, ReactorError>;
}

/// Degenerate factory returning one preconfigured context for every
/// connection - used by components that need no per-connection variation,
/// such as a forwarding-only listener.
pub struct StaticContextFactory {
    context: Arc<dyn ProtocolContext>,
}

impl StaticContextFactory {
    pub fn new(context: Arc<dyn ProtocolContext>) -> Self {
        Self { context }
    }
}

impl ProtocolContextFactory for StaticContextFactory {
    fn create_context(
        &self,
        _daemon: &DaemonContext,
        _peer: SocketAddr,
    ) -> Result<Arc<dyn ProtocolContext>, ReactorError> {
        Ok(self.context.clone())
    }
}
