//! Reactor-facing socket handler contract

use std::io;

use mio::{Interest, Registry, Token};

/// Work handed off the reactor thread.
pub type Task = Box<dyn FnOnce() + Send>;

/// Drives one registered channel on behalf of a selector thread.
///
/// There are two concrete kinds: the data-channel handler
/// ([`ConnectionHandler`](crate::connection_handler::ConnectionHandler))
/// and listening acceptors. A handler is owned by exactly one selector
/// thread and all its methods run on that thread, except `add_task` which
/// may be called from the engine while a dispatch is in progress.
pub trait SocketHandler: Send {
    /// Interest set to register at creation time.
    fn initial_interest(&self) -> Interest;

    /// Register the underlying source with the selector.
    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()>;

    /// Adjust interest without tearing the registration down.
    fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest)
        -> io::Result<()>;

    fn deregister(&mut self, registry: &Registry) -> io::Result<()>;

    /// Read readiness. Returns false when the channel should be removed.
    fn process_read_event(&mut self) -> bool;

    /// Write readiness. Returns false when the channel should be removed.
    fn process_write_event(&mut self) -> bool;

    fn wants_read(&self) -> bool {
        true
    }

    fn wants_write(&self) -> bool {
        false
    }

    /// Hand blocking work to the connection's executor - the sanctioned
    /// escape hatch from "never block the reactor".
    fn add_task(&self, task: Task);

    /// Periodic tick delivered on select timeout.
    fn on_idle(&mut self) {}

    /// Release the OS resource. Called after deregistration.
    fn close(&mut self);
}
