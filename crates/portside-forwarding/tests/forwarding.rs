//! End-to-end forwarding tests: a real TCP listener, a real selector pool
//! and a loopback connection whose channels echo everything back.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use portside_core::{
    Channel, ChannelDataSink, ChannelEventListener, ChannelOpenFuture, Connection, ConnectionId,
    Event, EventCode, EventListener, EventService, PropertyMap, TunnelParams,
};
use portside_forwarding::{ForwardingFactory, ForwardingManager, TcpForwardingFactory};
use portside_reactor::{
    Executor, SelectorThreadPool, SelectorThreadPoolConfig, SocketOptions,
};

struct EchoChannel {
    sink: Mutex<Option<Arc<dyn ChannelDataSink>>>,
    open: AtomicBool,
}

impl EchoChannel {
    fn create() -> Arc<EchoChannel> {
        Arc::new(Self {
            sink: Mutex::new(None),
            open: AtomicBool::new(true),
        })
    }
}

impl Channel for EchoChannel {
    fn write(&self, data: Bytes) -> std::io::Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(std::io::ErrorKind::BrokenPipe.into());
        }
        if let Some(sink) = self.sink.lock().unwrap().as_ref() {
            sink.on_data(data);
        }
        Ok(())
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            if let Some(sink) = self.sink.lock().unwrap().as_ref() {
                sink.on_eof();
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn set_sink(&self, sink: Arc<dyn ChannelDataSink>) {
        *self.sink.lock().unwrap() = Some(sink);
    }
}

/// Connection that accepts every channel open and echoes channel data.
/// Opens can be stalled to model a slow remote peer; `release_stalled`
/// completes them later.
struct EchoConnection {
    id: ConnectionId,
    properties: PropertyMap,
    refuse_opens: AtomicBool,
    stall_opens: AtomicBool,
    stalled: Mutex<Vec<(Arc<ChannelOpenFuture>, Arc<dyn ChannelEventListener>)>>,
    last_params: Mutex<Option<TunnelParams>>,
}

impl EchoConnection {
    fn create() -> Arc<EchoConnection> {
        Arc::new(Self {
            id: ConnectionId::new(),
            properties: PropertyMap::new(),
            refuse_opens: AtomicBool::new(false),
            stall_opens: AtomicBool::new(false),
            stalled: Mutex::new(Vec::new()),
            last_params: Mutex::new(None),
        })
    }

    fn release_stalled(&self) {
        for (future, listener) in self.stalled.lock().unwrap().drain(..) {
            let channel: Arc<dyn Channel> = EchoChannel::create();
            future.opened(channel.clone());
            listener.on_channel_open(&channel);
        }
    }
}

impl Connection for EchoConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn username(&self) -> &str {
        "echo"
    }

    fn properties(&self) -> &PropertyMap {
        &self.properties
    }

    fn open_forwarding_channel(
        &self,
        params: TunnelParams,
        listener: Arc<dyn ChannelEventListener>,
    ) -> Arc<ChannelOpenFuture> {
        *self.last_params.lock().unwrap() = Some(params);
        let future = Arc::new(ChannelOpenFuture::new());
        if self.refuse_opens.load(Ordering::SeqCst) {
            future.failed();
            return future;
        }
        if self.stall_opens.load(Ordering::SeqCst) {
            self.stalled
                .lock()
                .unwrap()
                .push((future.clone(), listener));
            return future;
        }
        let channel: Arc<dyn Channel> = EchoChannel::create();
        future.opened(channel.clone());
        listener.on_channel_open(&channel);
        future
    }
}

struct Rig {
    pool: SelectorThreadPool,
    executor: Arc<Executor>,
    events: Arc<EventService>,
    manager: ForwardingManager,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl Rig {
    fn new() -> Rig {
        init_tracing();
        let pool = SelectorThreadPool::new(SelectorThreadPoolConfig {
            permanent_threads: 2,
            maximum_channels: 64,
            select_timeout: Duration::from_millis(20),
        })
        .unwrap();
        let events = Arc::new(EventService::new());
        Rig {
            pool,
            executor: Arc::new(Executor::new(2)),
            events: events.clone(),
            manager: ForwardingManager::new(events),
        }
    }

    fn factory(&self, connection: &Arc<EchoConnection>) -> Arc<TcpForwardingFactory> {
        Arc::new(TcpForwardingFactory::new(
            connection.clone(),
            self.pool.clone(),
            self.executor.clone(),
            SocketOptions::default(),
            self.events.clone(),
        ))
    }
}

fn as_connection(connection: &Arc<EchoConnection>) -> Arc<dyn Connection> {
    connection.clone()
}

struct CodeCollector {
    seen: Mutex<Vec<EventCode>>,
}

impl EventListener for CodeCollector {
    fn on_event(&self, event: &Event) {
        self.seen.lock().unwrap().push(event.code());
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
fn test_tunnel_round_trip_through_echo_channel() {
    let rig = Rig::new();
    let connection = EchoConnection::create();
    let collector = Arc::new(CodeCollector {
        seen: Mutex::new(Vec::new()),
    });
    rig.events.add_listener(collector.clone());

    let port = rig
        .manager
        .start_listening("127.0.0.1", 0, &as_connection(&connection), rig.factory(&connection))
        .unwrap();
    assert_ne!(port, 0);

    let mut client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client.write_all(b"ping through the tunnel").unwrap();

    let mut echoed = vec![0u8; b"ping through the tunnel".len()];
    client.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"ping through the tunnel");

    // The channel open saw an accurate snapshot of the forward
    let params = connection.last_params.lock().unwrap().clone().unwrap();
    assert_eq!(params.bind_address, "127.0.0.1");
    assert_eq!(params.bind_port, port);

    let seen = collector.seen.lock().unwrap().clone();
    assert!(seen.contains(&EventCode::ForwardingStarted));
    assert!(seen.contains(&EventCode::TunnelOpened));

    rig.pool.shutdown();
}

#[test]
fn test_stop_listening_kills_active_tunnels_when_asked() {
    let rig = Rig::new();
    let connection = EchoConnection::create();
    let factory = rig.factory(&connection);

    let port = rig
        .manager
        .start_listening("127.0.0.1", 0, &as_connection(&connection), factory.clone())
        .unwrap();

    let mut client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    // Round-trip once so the tunnel is fully established
    client.write_all(b"hello").unwrap();
    let mut buffer = [0u8; 5];
    client.read_exact(&mut buffer).unwrap();
    assert!(wait_for(Duration::from_secs(2), || {
        factory.active_tunnels().active_count() == 1
    }));

    let key = format!("127.0.0.1:{}", port);
    assert!(rig
        .manager
        .stop_listening(&key, true, &as_connection(&connection))
        .unwrap());

    // The established tunnel is torn down: the client sees EOF
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    // And the port stops accepting new clients
    assert!(wait_for(Duration::from_secs(2), || {
        std::net::TcpStream::connect_timeout(
            &format!("127.0.0.1:{}", port).parse().unwrap(),
            Duration::from_millis(100),
        )
        .is_err()
    }));

    rig.pool.shutdown();
}

#[test]
fn test_open_completing_after_stop_is_not_admitted() {
    let rig = Rig::new();
    let connection = EchoConnection::create();
    connection.stall_opens.store(true, Ordering::SeqCst);
    let factory = rig.factory(&connection);

    let port = rig
        .manager
        .start_listening("127.0.0.1", 0, &as_connection(&connection), factory.clone())
        .unwrap();

    // The accept reaches the connection but the open hangs there
    let _client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert!(wait_for(Duration::from_secs(2), || {
        !connection.stalled.lock().unwrap().is_empty()
    }));

    // Stop accepting without killing the (zero) established tunnels
    let key = format!("127.0.0.1:{}", port);
    assert!(rig
        .manager
        .stop_listening(&key, false, &as_connection(&connection))
        .unwrap());

    // The open completes only now; a stopped forward must refuse it,
    // otherwise the tunnel would outlive every teardown path
    connection.release_stalled();
    assert_eq!(factory.active_tunnels().active_count(), 0);

    rig.pool.shutdown();
}

#[test]
fn test_refused_channel_open_drops_the_client() {
    let rig = Rig::new();
    let connection = EchoConnection::create();
    connection.refuse_opens.store(true, Ordering::SeqCst);

    let port = rig
        .manager
        .start_listening("127.0.0.1", 0, &as_connection(&connection), rig.factory(&connection))
        .unwrap();

    let mut client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    // No channel, no tunnel: the socket is closed without data
    let mut buffer = Vec::new();
    client.read_to_end(&mut buffer).unwrap();
    assert!(buffer.is_empty());

    rig.pool.shutdown();
}

#[test]
fn test_port_conflict_and_release_with_real_binds() {
    let rig = Rig::new();
    let alice = EchoConnection::create();
    let bob = EchoConnection::create();

    let port = rig
        .manager
        .start_listening("127.0.0.1", 0, &as_connection(&alice), rig.factory(&alice))
        .unwrap();

    let conflict = rig.manager.start_listening(
        "127.0.0.1",
        port,
        &as_connection(&bob),
        rig.factory(&bob),
    );
    assert!(conflict.is_err());

    rig.manager.stop_forwarding(&as_connection(&alice));
    assert!(wait_for(Duration::from_secs(2), || {
        rig.manager
            .start_listening("127.0.0.1", port, &as_connection(&bob), rig.factory(&bob))
            .is_ok()
    }));

    rig.pool.shutdown();
}
