//! Listening-socket handler
//!
//! One `AcceptHandler` per bound interface. Each readiness event accepts
//! clients until the listener would block; every accepted client gets its
//! own context, engine and `ConnectionHandler`, placed on the pool's
//! least-loaded selector thread. A failure while setting up one client
//! never takes the listener down.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use tracing::{debug, error, warn};

use crate::connection_handler::ConnectionHandler;
use crate::context::{DaemonContext, ProtocolContextFactory};
use crate::error::ReactorError;
use crate::handler::{SocketHandler, Task};
use crate::interface::ListeningInterface;
use crate::pool::{ChannelHandle, SelectorThreadPool};

pub struct AcceptHandler {
    listener: TcpListener,
    local_addr: SocketAddr,
    factory: Arc<dyn ProtocolContextFactory>,
    daemon: Arc<DaemonContext>,
    pool: SelectorThreadPool,
}

impl AcceptHandler {
    fn setup_client(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), ReactorError> {
        let context = self.factory.create_context(&self.daemon, peer)?;
        let handler = ConnectionHandler::accepted(
            stream,
            context.create_engine(),
            self.daemon.executor.clone(),
        );
        handler.apply_options(context.socket_options())?;
        self.pool.register_channel(Box::new(handler))?;
        debug!("accepted connection from {} on {}", peer, self.local_addr);
        Ok(())
    }
}

impl SocketHandler for AcceptHandler {
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
        // A listener only ever wants readability
        registry.reregister(&mut self.listener, token, Interest::READABLE)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.listener)
    }

    fn process_read_event(&mut self) -> bool {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.setup_client(stream, peer) {
                        warn!("failed to set up client from {}: {}", peer, e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("accept failed on {}: {}", self.local_addr, e);
                    return true;
                }
            }
        }
    }

    fn process_write_event(&mut self) -> bool {
        true
    }

    fn add_task(&self, task: Task) {
        self.daemon.executor.execute(task);
    }

    fn close(&mut self) {
        debug!("listener on {} closed", self.local_addr);
    }
}

/// Bind an interface and hand the listener to the pool. Returns the
/// channel handle (close it to stop listening) and the resolved address.
pub fn bind_interface(
    pool: &SelectorThreadPool,
    daemon: Arc<DaemonContext>,
    interface: &ListeningInterface,
) -> Result<(ChannelHandle, SocketAddr), ReactorError> {
    let (listener, resolved) = interface.bind()?;
    let handler = AcceptHandler {
        listener,
        local_addr: resolved,
        factory: interface.factory(),
        daemon,
        pool: pool.clone(),
    };
    let handle = pool.register_channel(Box::new(handler))?;
    Ok((handle, resolved))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    use bytes::BytesMut;
    use portside_core::{DisconnectReason, EventService};

    use crate::context::{ProtocolContext, SocketOptions, StaticContextFactory};
    use crate::engine::{ProtocolEngine, SocketInfo, WriteCompletion};
    use crate::executor::Executor;
    use crate::pool::SelectorThreadPoolConfig;

    struct CountingEngine {
        connects: Arc<AtomicUsize>,
    }

    impl ProtocolEngine for CountingEngine {
        fn on_socket_connect(&mut self, _info: &SocketInfo) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }
        fn on_socket_close(&mut self) {}
        fn on_socket_read(&mut self, _data: &[u8]) -> bool {
            false
        }
        fn on_socket_write(&mut self, _out: &mut BytesMut) -> Option<WriteCompletion> {
            None
        }
        fn wants_to_write(&self) -> bool {
            false
        }
        fn is_connected(&self) -> bool {
            true
        }
        fn disconnect(&mut self, _reason: DisconnectReason, _description: &str) {}
    }

    struct CountingContext {
        options: SocketOptions,
        connects: Arc<AtomicUsize>,
    }

    impl ProtocolContext for CountingContext {
        fn socket_options(&self) -> &SocketOptions {
            &self.options
        }
        fn create_engine(&self) -> Box<dyn ProtocolEngine> {
            Box::new(CountingEngine {
                connects: self.connects.clone(),
            })
        }
    }

    fn wait_for(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        check()
    }

    #[test]
    fn test_accepted_clients_reach_the_engine() {
        let pool = SelectorThreadPool::new(SelectorThreadPoolConfig {
            permanent_threads: 1,
            maximum_channels: 64,
            select_timeout: Duration::from_millis(20),
        })
        .unwrap();
        let daemon = Arc::new(DaemonContext::new(
            Arc::new(EventService::new()),
            Arc::new(Executor::new(1)),
        ));
        let connects = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(StaticContextFactory::new(Arc::new(CountingContext {
            options: SocketOptions::default(),
            connects: connects.clone(),
        })));

        let interface =
            ListeningInterface::new("127.0.0.1:0".parse().unwrap(), factory);
        let (_handle, resolved) = bind_interface(&pool, daemon, &interface).unwrap();

        let _first = std::net::TcpStream::connect(resolved).unwrap();
        let _second = std::net::TcpStream::connect(resolved).unwrap();

        assert!(wait_for(Duration::from_secs(2), || {
            connects.load(Ordering::SeqCst) == 2
        }));
        pool.shutdown();
    }

    /// Factory that refuses the first client and serves the rest.
    struct FlakyContextFactory {
        attempts: AtomicUsize,
        context: Arc<CountingContext>,
    }

    impl ProtocolContextFactory for FlakyContextFactory {
        fn create_context(
            &self,
            _daemon: &DaemonContext,
            peer: SocketAddr,
        ) -> Result<Arc<dyn ProtocolContext>, ReactorError> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(ReactorError::ContextFailed(format!(
                    "no context for {}",
                    peer
                )));
            }
            Ok(self.context.clone())
        }
    }

    #[test]
    fn test_context_failure_does_not_take_the_listener_down() {
        let pool = SelectorThreadPool::new(SelectorThreadPoolConfig {
            permanent_threads: 1,
            maximum_channels: 64,
            select_timeout: Duration::from_millis(20),
        })
        .unwrap();
        let daemon = Arc::new(DaemonContext::new(
            Arc::new(EventService::new()),
            Arc::new(Executor::new(1)),
        ));
        let connects = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(FlakyContextFactory {
            attempts: AtomicUsize::new(0),
            context: Arc::new(CountingContext {
                options: SocketOptions::default(),
                connects: connects.clone(),
            }),
        });

        let interface =
            ListeningInterface::new("127.0.0.1:0".parse().unwrap(), factory);
        let (_handle, resolved) = bind_interface(&pool, daemon, &interface).unwrap();

        // First client is refused a context; the listener survives it
        let _refused = std::net::TcpStream::connect(resolved).unwrap();
        let _served = std::net::TcpStream::connect(resolved).unwrap();

        assert!(wait_for(Duration::from_secs(2), || {
            connects.load(Ordering::SeqCst) == 1
        }));
        pool.shutdown();
    }

    #[test]
    fn test_closing_the_handle_stops_listening() {
        let pool = SelectorThreadPool::new(SelectorThreadPoolConfig {
            permanent_threads: 1,
            maximum_channels: 64,
            select_timeout: Duration::from_millis(20),
        })
        .unwrap();
        let daemon = Arc::new(DaemonContext::new(
            Arc::new(EventService::new()),
            Arc::new(Executor::new(1)),
        ));
        let connects = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(StaticContextFactory::new(Arc::new(CountingContext {
            options: SocketOptions::default(),
            connects: connects.clone(),
        })));

        let interface =
            ListeningInterface::new("127.0.0.1:0".parse().unwrap(), factory);
        let (handle, resolved) = bind_interface(&pool, daemon, &interface).unwrap();
        handle.close();

        // Once the close lands, fresh connects are refused
        assert!(wait_for(Duration::from_secs(2), || {
            std::net::TcpStream::connect_timeout(&resolved, Duration::from_millis(100)).is_err()
        }));
        pool.shutdown();
    }
}
