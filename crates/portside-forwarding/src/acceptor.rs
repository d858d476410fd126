//! Forwarded-port acceptor
//!
//! Listens on a bound forwarding port. Each accepted tunnel client asks
//! the owning connection for a logical channel; only once the remote side
//! confirms the open does the raw socket get a `TunnelEngine` and a place
//! on the selector pool. A refused open closes the client socket and
//! registers nothing.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use socket2::SockRef;
use tracing::{debug, error, warn};

use portside_core::{
    Channel, ChannelEventListener, Connection, Event, EventCode, EventService, TunnelParams,
};
use portside_reactor::{
    ConnectionHandler, Executor, SelectorThreadPool, SocketHandler, SocketOptions, Task,
};

use crate::engine::{TunnelEngine, TunnelOutbound};
use crate::tunnels::ActiveTunnelManager;

pub struct TunnelAcceptor {
    listener: TcpListener,
    bind_address: String,
    bind_port: u16,
    connection: Arc<dyn Connection>,
    pool: SelectorThreadPool,
    executor: Arc<Executor>,
    options: SocketOptions,
    events: Arc<EventService>,
    tunnels: Arc<ActiveTunnelManager>,
}

impl TunnelAcceptor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        listener: TcpListener,
        bind_address: String,
        bind_port: u16,
        connection: Arc<dyn Connection>,
        pool: SelectorThreadPool,
        executor: Arc<Executor>,
        options: SocketOptions,
        events: Arc<EventService>,
        tunnels: Arc<ActiveTunnelManager>,
    ) -> Self {
        Self {
            listener,
            bind_address,
            bind_port,
            connection,
            pool,
            executor,
            options,
            events,
            tunnels,
        }
    }

    fn handle_client(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = self.options.apply(&SockRef::from(&stream)) {
            debug!("failed to apply socket options for {}: {}", peer, e);
        }
        let params = TunnelParams {
            originator: peer,
            bind_address: self.bind_address.clone(),
            bind_port: self.bind_port,
        };
        let pending = Arc::new(PendingTunnel {
            stream: Mutex::new(Some(stream)),
            outbound: Mutex::new(None),
            params: params.clone(),
            connection: self.connection.clone(),
            pool: self.pool.clone(),
            executor: self.executor.clone(),
            events: self.events.clone(),
            tunnels: self.tunnels.clone(),
        });
        let open = self
            .connection
            .open_forwarding_channel(params, pending.clone());
        let on_failure = pending;
        open.add_listener(move |future| {
            if !future.is_succeeded() {
                on_failure.abort();
            }
        });
    }
}

impl SocketHandler for TunnelAcceptor {
    fn initial_interest(&self) -> Interest {
        Interest::READABLE
    }

    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.listener, token, Interest::READABLE)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        _interest: Interest,
    ) -> io::Result<()> {
        registry.reregister(&mut self.listener, token, Interest::READABLE)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.listener)
    }

    fn process_read_event(&mut self) -> bool {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(
                        "tunnel client {} hit {}:{}",
                        peer, self.bind_address, self.bind_port
                    );
                    self.handle_client(stream, peer);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(
                        "accept failed on {}:{}: {}",
                        self.bind_address, self.bind_port, e
                    );
                    return true;
                }
            }
        }
    }

    fn process_write_event(&mut self) -> bool {
        true
    }

    fn add_task(&self, task: Task) {
        self.executor.execute(task);
    }

    fn close(&mut self) {
        debug!(
            "forwarding listener {}:{} closed",
            self.bind_address, self.bind_port
        );
    }
}

/// One accepted client waiting for its channel-open verdict. Holds the raw
/// socket until the remote side answers; the socket is dropped unused when
/// the open fails or the kill latch already fell.
struct PendingTunnel {
    stream: Mutex<Option<TcpStream>>,
    outbound: Mutex<Option<Arc<TunnelOutbound>>>,
    params: TunnelParams,
    connection: Arc<dyn Connection>,
    pool: SelectorThreadPool,
    executor: Arc<Executor>,
    events: Arc<EventService>,
    tunnels: Arc<ActiveTunnelManager>,
}

impl PendingTunnel {
    fn take_stream(&self) -> Option<TcpStream> {
        match self.stream.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn abort(&self) {
        if self.take_stream().is_some() {
            debug!("channel open refused; dropping tunnel client");
        }
    }
}

impl ChannelEventListener for PendingTunnel {
    fn on_channel_open(&self, channel: &Arc<dyn Channel>) {
        let Some(stream) = self.take_stream() else {
            return;
        };
        if !self.tunnels.on_channel_open(channel) {
            // Kill latch is set; the client socket drops here
            return;
        }

        let outbound = Arc::new(TunnelOutbound::new());
        channel.set_sink(outbound.clone());
        let engine = TunnelEngine::new(channel.clone(), outbound.clone());
        let handler = ConnectionHandler::accepted(
            stream,
            Box::new(engine),
            self.executor.clone(),
        );
        match self.pool.register_channel(Box::new(handler)) {
            Ok(handle) => {
                outbound.attach(handle);
                match self.outbound.lock() {
                    Ok(mut slot) => *slot = Some(outbound),
                    Err(poisoned) => *poisoned.into_inner() = Some(outbound),
                }
                self.events.fire_event(
                    Event::new(EventCode::TunnelOpened)
                        .with_connection(self.connection.clone())
                        .with_attribute("originator", self.params.originator.to_string())
                        .with_attribute("port", self.params.bind_port.to_string()),
                );
            }
            Err(e) => {
                warn!("failed to register tunnel socket: {}", e);
                channel.close();
                self.tunnels.on_channel_close(channel);
            }
        }
    }

    fn on_channel_close(&self, channel: &Arc<dyn Channel>) {
        let outbound = match self.outbound.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(outbound) = outbound {
            outbound.close();
        }
        self.tunnels.on_channel_close(channel);
        self.events.fire_event(
            Event::new(EventCode::TunnelClosed)
                .with_connection(self.connection.clone())
                .with_attribute("originator", self.params.originator.to_string())
                .with_attribute("port", self.params.bind_port.to_string()),
        );
    }
}
