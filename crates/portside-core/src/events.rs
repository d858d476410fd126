//! Event service
//!
//! An explicit service object constructed once at process start and handed
//! to every component that fires events. Event codes carry a static
//! code/name mapping so debug output never needs runtime introspection.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::{error, trace};

use crate::connection::Connection;

/// Numeric event codes with a compile-time bidirectional name map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EventCode {
    ConnectionAttached = 100,
    ConnectionDetached = 101,
    ForwardingStarted = 301,
    ForwardingStopped = 302,
    TunnelOpened = 303,
    TunnelClosed = 304,
}

impl EventCode {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            EventCode::ConnectionAttached => "CONNECTION_ATTACHED",
            EventCode::ConnectionDetached => "CONNECTION_DETACHED",
            EventCode::ForwardingStarted => "FORWARDING_STARTED",
            EventCode::ForwardingStopped => "FORWARDING_STOPPED",
            EventCode::TunnelOpened => "TUNNEL_OPENED",
            EventCode::TunnelClosed => "TUNNEL_CLOSED",
        }
    }

    pub fn from_code(code: u32) -> Option<EventCode> {
        match code {
            100 => Some(EventCode::ConnectionAttached),
            101 => Some(EventCode::ConnectionDetached),
            301 => Some(EventCode::ForwardingStarted),
            302 => Some(EventCode::ForwardingStopped),
            303 => Some(EventCode::TunnelOpened),
            304 => Some(EventCode::TunnelClosed),
            _ => None,
        }
    }
}

/// One fired event: a code, the connection it concerns and free-form
/// string attributes (bound address, port, ...).
pub struct Event {
    code: EventCode,
    connection: Option<Arc<dyn Connection>>,
    attributes: HashMap<String, String>,
}

impl Event {
    pub fn new(code: EventCode) -> Self {
        Self {
            code,
            connection: None,
            attributes: HashMap::new(),
        }
    }

    pub fn with_connection(mut self, connection: Arc<dyn Connection>) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn code(&self) -> EventCode {
        self.code
    }

    pub fn connection(&self) -> Option<&Arc<dyn Connection>> {
        self.connection.as_ref()
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Event);
}

/// Fan-out point for events. A misbehaving listener never takes the firing
/// component down with it.
pub struct EventService {
    listeners: Mutex<Vec<Arc<dyn EventListener>>>,
}

impl EventService {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(listener);
        }
    }

    pub fn fire_event(&self, event: Event) {
        trace!("firing event {} ({})", event.code().name(), event.code().code());
        let listeners = match self.listeners.lock() {
            Ok(listeners) => listeners.clone(),
            Err(_) => return,
        };
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.on_event(&event))).is_err() {
                error!(
                    "event listener panicked handling {}",
                    event.code().name()
                );
            }
        }
    }
}

impl Default for EventService {
    fn default() -> Self {
        Self::new()
    }
}
