//! Tunnel data engine
//!
//! Bridges one accepted tunnel client socket and one logical forwarding
//! channel. Socket bytes go straight into `Channel::write`; data arriving
//! from the channel side lands in a shared outbound queue and the reactor
//! is woken through the `ChannelHandle`. The engine captures no mutable
//! reactor state; every cross-thread wakeup goes through explicit handles.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use portside_core::{Channel, DisconnectReason};
use portside_reactor::{ChannelHandle, ProtocolEngine, SocketInfo, WriteCompletion};
use tracing::{debug, trace};

/// Socket-bound side of a tunnel, shared between the reactor (draining)
/// and the channel data path (filling). The handle slot is populated once
/// the engine's socket is registered with the pool.
pub struct TunnelOutbound {
    queue: Mutex<VecDeque<Bytes>>,
    closed: AtomicBool,
    handle: Mutex<Option<ChannelHandle>>,
}

impl TunnelOutbound {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<Bytes>> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Attach the reactor handle after registration; wakes the reactor in
    /// case data or a close arrived in the meantime.
    pub fn attach(&self, handle: ChannelHandle) {
        match self.handle.lock() {
            Ok(mut slot) => *slot = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }
        self.wake();
    }

    /// Queue data flowing from the channel toward the tunnel client.
    pub fn push(&self, data: Bytes) {
        if self.closed.load(Ordering::Acquire) {
            trace!("dropping {} bytes for a closed tunnel", data.len());
            return;
        }
        self.lock_queue().push_back(data);
        self.wake();
    }

    /// The channel side closed; the socket goes down once the queue drains.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.wake();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn wake(&self) {
        let handle = match self.handle.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(handle) = handle {
            handle.update_interest();
        }
    }

    fn pop(&self) -> Option<Bytes> {
        self.lock_queue().pop_front()
    }

    fn is_empty(&self) -> bool {
        self.lock_queue().is_empty()
    }
}

impl Default for TunnelOutbound {
    fn default() -> Self {
        Self::new()
    }
}

/// The outbound queue doubles as the channel's data sink: remote data is
/// queued for the tunnel client, remote EOF drains and closes the socket.
impl portside_core::ChannelDataSink for TunnelOutbound {
    fn on_data(&self, data: Bytes) {
        self.push(data);
    }

    fn on_eof(&self) {
        self.close();
    }
}

pub struct TunnelEngine {
    channel: Arc<dyn Channel>,
    outbound: Arc<TunnelOutbound>,
}

impl TunnelEngine {
    pub fn new(channel: Arc<dyn Channel>, outbound: Arc<TunnelOutbound>) -> Self {
        Self { channel, outbound }
    }
}

impl ProtocolEngine for TunnelEngine {
    fn on_socket_connect(&mut self, info: &SocketInfo) {
        debug!("tunnel socket up, peer {:?}", info.peer_addr);
    }

    fn on_socket_close(&mut self) {
        self.channel.close();
        self.outbound.close();
    }

    fn on_socket_read(&mut self, data: &[u8]) -> bool {
        if self.channel.write(Bytes::copy_from_slice(data)).is_err() {
            debug!("channel rejected tunnel data; closing");
            self.channel.close();
            self.outbound.close();
        }
        self.wants_to_write()
    }

    fn on_socket_write(&mut self, out: &mut BytesMut) -> Option<WriteCompletion> {
        while let Some(data) = self.outbound.pop() {
            out.extend_from_slice(&data);
        }
        None
    }

    // Stays true after a close so the selector delivers one final write
    // event and observes the disconnected engine.
    fn wants_to_write(&self) -> bool {
        !self.outbound.is_empty() || self.outbound.is_closed()
    }

    fn is_connected(&self) -> bool {
        !(self.outbound.is_closed() && self.outbound.is_empty())
    }

    fn disconnect(&mut self, reason: DisconnectReason, description: &str) {
        debug!("tunnel disconnect ({}): {}", reason.name(), description);
        self.channel.close();
        self.outbound.close();
    }
}
