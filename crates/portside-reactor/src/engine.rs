//! Per-connection protocol engine contract
//!
//! The reactor knows nothing about SSH. Each connection owns one
//! `ProtocolEngine` that consumes socket lifecycle and I/O events and
//! produces protocol behaviour. All callbacks run on a selector thread and
//! must not block; anything blocking goes through
//! [`SocketHandler::add_task`](crate::handler::SocketHandler::add_task).

use std::net::SocketAddr;

use bytes::BytesMut;
use portside_core::DisconnectReason;

/// Immutable snapshot of a connected socket, handed to the engine when the
/// transport comes up.
#[derive(Debug, Clone)]
pub struct SocketInfo {
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
}

/// Callback invoked once a batch of engine output has been fully flushed
/// to the socket.
pub type WriteCompletion = Box<dyn FnOnce() + Send>;

/// The state machine behind one connection.
pub trait ProtocolEngine: Send {
    /// The underlying socket is connected (accepted, or an outbound
    /// connect completed).
    fn on_socket_connect(&mut self, info: &SocketInfo);

    /// The underlying socket closed (EOF, reset, or forced closure).
    fn on_socket_close(&mut self);

    /// Inbound bytes. Must not block; data the engine cannot process yet
    /// is the engine's responsibility to buffer. Returns whether the
    /// engine now has output pending.
    fn on_socket_read(&mut self, data: &[u8]) -> bool;

    /// Append pending output to `out`. The returned completion runs once
    /// those bytes have been fully written to the socket.
    fn on_socket_write(&mut self, out: &mut BytesMut) -> Option<WriteCompletion>;

    /// Polled between selects to decide write-interest. Returning true
    /// with nothing to write busy-loops the selector.
    fn wants_to_write(&self) -> bool;

    fn is_connected(&self) -> bool;

    /// Initiate a protocol-level disconnect. Idempotent; must not fail
    /// when the socket is already gone.
    fn disconnect(&mut self, reason: DisconnectReason, description: &str);

    /// Periodic tick from the selector thread, for keepalives and
    /// timeouts.
    fn on_idle(&mut self) {}
}
