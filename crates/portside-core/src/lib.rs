//! Collaborator contracts shared across the portside stack
//!
//! The reactor and forwarding crates consume connections, channels and
//! events through the narrow traits defined here; the SSH transport,
//! authentication and channel layers live behind them.

pub mod connection;
pub mod disconnect;
pub mod events;
pub mod future;

pub use connection::{
    Channel, ChannelDataSink, ChannelEventListener, ChannelOpenFuture, Connection, ConnectionId,
    PropertyMap, TunnelParams,
};
pub use disconnect::DisconnectReason;
pub use events::{Event, EventCode, EventListener, EventService};
pub use future::{CompletionFuture, ConnectRequestFuture, DisconnectRequestFuture};
