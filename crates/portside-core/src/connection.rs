//! Connection and channel collaborator contracts
//!
//! The reactor drives sockets; the SSH transport, authentication and
//! channel multiplexing layers sit behind these traits. The forwarding
//! engine only needs a connection identity, a property bag and the ability
//! to open a logical forwarding channel.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use dashmap::DashMap;
use uuid::Uuid;

use crate::future::CompletionFuture;

/// Unique identifier of one logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Mutable key/value bag attached to a connection, e.g. for caching a
/// per-connection file factory or a callback-client handle.
pub struct PropertyMap {
    inner: DashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl PropertyMap {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    pub fn set(&self, key: impl Into<String>, value: Arc<dyn Any + Send + Sync>) {
        self.inner.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.get(key).map(|entry| entry.value().clone())
    }

    /// Typed lookup; `None` when the key is absent or holds another type.
    pub fn get_as<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.get(key).and_then(|value| value.downcast::<T>().ok())
    }

    pub fn remove(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.remove(key).map(|(_, value)| value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }
}

impl Default for PropertyMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Parameters for opening one forwarded tunnel channel: an immutable
/// snapshot of where the client came from and which forward it hit.
#[derive(Debug, Clone)]
pub struct TunnelParams {
    /// Address of the tunnel client that connected to the forwarded port
    pub originator: SocketAddr,
    /// Address the forwarding listener is bound to
    pub bind_address: String,
    /// Port the forwarding listener is bound to
    pub bind_port: u16,
}

/// Consumer of data arriving on a channel from the remote side.
pub trait ChannelDataSink: Send + Sync {
    fn on_data(&self, data: Bytes);
    fn on_eof(&self);
}

/// One logical channel multiplexed over a connection's transport.
pub trait Channel: Send + Sync {
    /// Queue data for the remote side. Must not block.
    fn write(&self, data: Bytes) -> std::io::Result<()>;

    /// Close the channel. Idempotent.
    fn close(&self);

    fn is_open(&self) -> bool;

    /// Attach the consumer for remote data. Channels that never deliver
    /// remote data may leave the default no-op in place.
    fn set_sink(&self, _sink: Arc<dyn ChannelDataSink>) {}
}

/// Open/close hooks consumed by the tunnel tracking layer.
pub trait ChannelEventListener: Send + Sync {
    fn on_channel_open(&self, channel: &Arc<dyn Channel>);
    fn on_channel_close(&self, channel: &Arc<dyn Channel>);
}

/// Listenable open-future for a channel: completes once the remote side
/// confirmed or rejected the open request.
pub struct ChannelOpenFuture {
    future: CompletionFuture,
    channel: Mutex<Option<Arc<dyn Channel>>>,
}

impl ChannelOpenFuture {
    pub fn new() -> Self {
        Self {
            future: CompletionFuture::new(),
            channel: Mutex::new(None),
        }
    }

    pub fn opened(&self, channel: Arc<dyn Channel>) {
        if let Ok(mut slot) = self.channel.lock() {
            *slot = Some(channel);
        }
        self.future.done(true);
    }

    pub fn failed(&self) {
        self.future.done(false);
    }

    pub fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.channel.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn is_done(&self) -> bool {
        self.future.is_done()
    }

    pub fn is_succeeded(&self) -> bool {
        self.future.is_succeeded()
    }

    pub fn wait_for(&self, timeout: std::time::Duration) -> bool {
        self.future.wait_for(timeout)
    }

    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&CompletionFuture) + Send + 'static,
    {
        self.future.add_listener(listener)
    }
}

impl Default for ChannelOpenFuture {
    fn default() -> Self {
        Self::new()
    }
}

/// One authenticated logical connection, as seen by the forwarding engine.
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    fn username(&self) -> &str;

    fn properties(&self) -> &PropertyMap;

    /// Open a forwarded-tcpip channel over this connection's multiplexed
    /// transport. The listener receives open/close notifications; the
    /// returned future completes when the remote side answers.
    fn open_forwarding_channel(
        &self,
        params: TunnelParams,
        listener: Arc<dyn ChannelEventListener>,
    ) -> Arc<ChannelOpenFuture>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_map_typed_roundtrip() {
        let properties = PropertyMap::new();
        properties.set("limit", Arc::new(42usize));

        assert!(properties.contains("limit"));
        assert_eq!(*properties.get_as::<usize>("limit").unwrap(), 42);

        // Wrong type yields None, the entry stays
        assert!(properties.get_as::<String>("limit").is_none());
        assert!(properties.contains("limit"));

        properties.remove("limit");
        assert!(!properties.contains("limit"));
    }

    #[test]
    fn test_connection_ids_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn test_channel_open_future_stashes_channel() {
        struct NullChannel;
        impl Channel for NullChannel {
            fn write(&self, _data: Bytes) -> std::io::Result<()> {
                Ok(())
            }
            fn close(&self) {}
            fn is_open(&self) -> bool {
                true
            }
        }

        let future = ChannelOpenFuture::new();
        assert!(future.channel().is_none());

        future.opened(Arc::new(NullChannel));
        assert!(future.is_succeeded());
        assert!(future.channel().unwrap().is_open());
    }
}
