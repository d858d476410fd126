//! Forwarding factories
//!
//! A factory owns one forwarded listener on behalf of one connection: it
//! performs the OS bind, wires the acceptor into the selector pool, and
//! can stop accepting (optionally killing the tunnels already running).

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use mio::net::TcpListener;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use portside_core::{Connection, ConnectionId, EventService};
use portside_reactor::{ChannelHandle, Executor, SelectorThreadPool, SocketOptions};

use crate::acceptor::TunnelAcceptor;
use crate::error::ForwardingError;
use crate::tunnels::ActiveTunnelManager;

const LISTEN_BACKLOG: i32 = 128;

pub trait ForwardingFactory: Send + Sync {
    /// Bind the listener. Port 0 requests an ephemeral port; the actually
    /// bound port is returned either way.
    fn bind(&self, address: &str, port: u16) -> Result<u16, ForwardingError>;

    /// Connection this forward belongs to.
    fn owner(&self) -> ConnectionId;

    /// Stop accepting new tunnel clients. Existing tunnels survive unless
    /// `drop_active_tunnels` is set.
    fn stop_accepting(&self, drop_active_tunnels: bool);

    fn active_tunnels(&self) -> &ActiveTunnelManager;
}

pub struct TcpForwardingFactory {
    connection: Arc<dyn Connection>,
    pool: SelectorThreadPool,
    executor: Arc<Executor>,
    options: SocketOptions,
    events: Arc<EventService>,
    tunnels: Arc<ActiveTunnelManager>,
    listening: Mutex<Option<ChannelHandle>>,
}

impl TcpForwardingFactory {
    pub fn new(
        connection: Arc<dyn Connection>,
        pool: SelectorThreadPool,
        executor: Arc<Executor>,
        options: SocketOptions,
        events: Arc<EventService>,
    ) -> Self {
        Self {
            connection,
            pool,
            executor,
            options,
            events,
            tunnels: Arc::new(ActiveTunnelManager::new()),
            listening: Mutex::new(None),
        }
    }

    fn bind_socket(address: &str, port: u16) -> Result<(TcpListener, u16), ForwardingError> {
        let bind_error = |source| ForwardingError::Bind {
            address: address.to_string(),
            port,
            source,
        };
        let ip: IpAddr = address.parse().map_err(|_| {
            ForwardingError::FactoryFailed(format!("{} is not an IP address", address))
        })?;
        let requested = SocketAddr::new(ip, port);

        let socket = Socket::new(
            Domain::for_address(requested),
            Type::STREAM,
            Some(Protocol::TCP),
        )
        .map_err(bind_error)?;
        socket.set_reuse_address(true).map_err(bind_error)?;
        socket.set_nonblocking(true).map_err(bind_error)?;
        socket.bind(&requested.into()).map_err(bind_error)?;
        socket.listen(LISTEN_BACKLOG).map_err(bind_error)?;

        let actual = socket
            .local_addr()
            .map_err(bind_error)?
            .as_socket()
            .map(|addr| addr.port())
            .unwrap_or(port);
        Ok((TcpListener::from_std(socket.into()), actual))
    }
}

impl ForwardingFactory for TcpForwardingFactory {
    fn bind(&self, address: &str, port: u16) -> Result<u16, ForwardingError> {
        let (listener, actual) = Self::bind_socket(address, port)?;
        let acceptor = TunnelAcceptor::new(
            listener,
            address.to_string(),
            actual,
            self.connection.clone(),
            self.pool.clone(),
            self.executor.clone(),
            self.options.clone(),
            self.events.clone(),
            self.tunnels.clone(),
        );
        let handle = self.pool.register_channel(Box::new(acceptor))?;
        match self.listening.lock() {
            Ok(mut slot) => *slot = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }
        debug!(
            "forwarding listener bound on {}:{} for connection {}",
            address,
            actual,
            self.connection.id()
        );
        Ok(actual)
    }

    fn owner(&self) -> ConnectionId {
        self.connection.id()
    }

    fn stop_accepting(&self, drop_active_tunnels: bool) {
        // Latch first: the listener close travels through the selector
        // command channel, and an open already in flight must not be
        // admitted after this call returns.
        self.tunnels.stop_admissions();
        let handle = match self.listening.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match handle {
            Some(handle) => handle.close(),
            None => warn!("stop_accepting on a factory that never bound"),
        }
        if drop_active_tunnels {
            self.tunnels.kill_all_tunnels();
        }
    }

    fn active_tunnels(&self) -> &ActiveTunnelManager {
        &self.tunnels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_socket_rejects_hostnames() {
        // Forwarding addresses arrive pre-resolved; a name is a caller bug
        let result = TcpForwardingFactory::bind_socket("localhost", 0);
        assert!(matches!(result, Err(ForwardingError::FactoryFailed(_))));
    }

    #[test]
    fn test_bind_socket_reports_unbindable_addresses() {
        let result = TcpForwardingFactory::bind_socket("192.0.2.1", 1);
        assert!(matches!(
            result,
            Err(ForwardingError::Bind { port: 1, .. })
        ));
    }
}
