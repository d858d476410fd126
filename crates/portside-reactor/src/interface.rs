//! Listening interface
//!
//! Describes a requested bind (address, port, backlog, options) and turns
//! it into a live nonblocking listener. Port 0 asks the kernel for an
//! ephemeral port; the resolved address is reported back so callers can
//! learn which port they actually got.

use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::TcpListener;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use crate::context::ProtocolContextFactory;
use crate::error::ReactorError;

const DEFAULT_BACKLOG: i32 = 128;

pub struct ListeningInterface {
    address: SocketAddr,
    backlog: i32,
    reuse_address: bool,
    factory: Arc<dyn ProtocolContextFactory>,
}

impl ListeningInterface {
    pub fn new(address: SocketAddr, factory: Arc<dyn ProtocolContextFactory>) -> Self {
        Self {
            address,
            backlog: DEFAULT_BACKLOG,
            reuse_address: true,
            factory,
        }
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn reuse_address(mut self, reuse: bool) -> Self {
        self.reuse_address = reuse;
        self
    }

    pub fn requested_address(&self) -> SocketAddr {
        self.address
    }

    pub fn factory(&self) -> Arc<dyn ProtocolContextFactory> {
        self.factory.clone()
    }

    /// Bind and start listening. Returns the listener plus the resolved
    /// local address (meaningful when port 0 was requested).
    pub fn bind(&self) -> Result<(TcpListener, SocketAddr), ReactorError> {
        let domain = Domain::for_address(self.address);
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(self.reuse_address)?;
        socket.set_nonblocking(true)?;
        socket.bind(&self.address.into())?;
        socket.listen(self.backlog)?;

        let resolved = socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| ReactorError::Io(std::io::Error::other("bind produced a non-IP address")))?;
        debug!("listening on {}", resolved);

        let listener = TcpListener::from_std(socket.into());
        Ok((listener, resolved))
    }
}
