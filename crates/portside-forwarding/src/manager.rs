//! Forwarding registry
//!
//! Process-wide book-keeping of who forwards what. Both maps live behind
//! one lock so the free-check, the OS bind and the registration are a
//! single atomic step: two connections can never end up owning the same
//! `address:port` key, and an ephemeral bind cannot race a conflicting
//! explicit one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use portside_core::{Connection, ConnectionId, Event, EventCode, EventService};

use crate::error::ForwardingError;
use crate::factory::ForwardingFactory;

fn forwarding_key(address: &str, port: u16) -> String {
    format!("{}:{}", address, port)
}

fn key_port(key: &str) -> Option<u16> {
    key.rsplit_once(':').and_then(|(_, port)| port.parse().ok())
}

struct Registry {
    listening_ports: HashMap<String, Arc<dyn ForwardingFactory>>,
    ports_by_connection: HashMap<ConnectionId, Vec<String>>,
}

impl Registry {
    fn port_taken(&self, port: u16) -> bool {
        // Any bind variant counts: an explicit address, 0.0.0.0 or ::
        self.listening_ports
            .keys()
            .any(|key| key_port(key) == Some(port))
    }
}

pub struct ForwardingManager {
    registry: Mutex<Registry>,
    events: Arc<EventService>,
}

impl ForwardingManager {
    pub fn new(events: Arc<EventService>) -> Self {
        Self {
            registry: Mutex::new(Registry {
                listening_ports: HashMap::new(),
                ports_by_connection: HashMap::new(),
            }),
            events,
        }
    }

    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// True when any bind variant of `port` is currently forwarded.
    pub fn is_listening(&self, port: u16) -> bool {
        self.lock_registry().port_taken(port)
    }

    /// Keys currently owned by `connection`.
    pub fn forwards_for(&self, connection: ConnectionId) -> Vec<String> {
        self.lock_registry()
            .ports_by_connection
            .get(&connection)
            .cloned()
            .unwrap_or_default()
    }

    /// Start forwarding `address:port` on behalf of `connection`. Port 0
    /// requests an ephemeral port. Returns the actually bound port.
    pub fn start_listening(
        &self,
        address: &str,
        port: u16,
        connection: &Arc<dyn Connection>,
        factory: Arc<dyn ForwardingFactory>,
    ) -> Result<u16, ForwardingError> {
        let (key, actual) = {
            let mut registry = self.lock_registry();
            if port > 0 && registry.port_taken(port) {
                return Err(ForwardingError::PortInUse {
                    address: address.to_string(),
                    port,
                });
            }
            // Bind under the lock: nothing is half-registered on failure,
            // and no other caller can grab the port in between.
            let actual = factory.bind(address, port)?;
            let key = forwarding_key(address, actual);
            registry.listening_ports.insert(key.clone(), factory);
            registry
                .ports_by_connection
                .entry(connection.id())
                .or_default()
                .push(key.clone());
            (key, actual)
        };

        info!("forwarding started on {} for {}", key, connection.id());
        self.events.fire_event(
            Event::new(EventCode::ForwardingStarted)
                .with_connection(connection.clone())
                .with_attribute("address", address)
                .with_attribute("port", actual.to_string()),
        );
        Ok(actual)
    }

    /// Stop the forward registered under `key`. Returns false when the key
    /// is unknown; fails when `connection` does not own the forward.
    pub fn stop_listening(
        &self,
        key: &str,
        drop_active_tunnels: bool,
        connection: &Arc<dyn Connection>,
    ) -> Result<bool, ForwardingError> {
        let factory = {
            let mut registry = self.lock_registry();
            let Some(factory) = registry.listening_ports.get(key) else {
                return Ok(false);
            };
            if factory.owner() != connection.id() {
                return Err(ForwardingError::NotOwner {
                    key: key.to_string(),
                });
            }
            let Some(factory) = registry.listening_ports.remove(key) else {
                return Ok(false);
            };
            if let Some(keys) = registry.ports_by_connection.get_mut(&connection.id()) {
                keys.retain(|owned| owned != key);
                if keys.is_empty() {
                    registry.ports_by_connection.remove(&connection.id());
                }
            }
            factory
        };

        factory.stop_accepting(drop_active_tunnels);
        info!("forwarding stopped on {} for {}", key, connection.id());
        self.events.fire_event(
            Event::new(EventCode::ForwardingStopped)
                .with_connection(connection.clone())
                .with_attribute("key", key),
        );
        Ok(true)
    }

    /// Tear down every forward owned by `connection`, active tunnels
    /// included. No-op when it owns none; safe to call repeatedly.
    pub fn stop_forwarding(&self, connection: &Arc<dyn Connection>) {
        let stopped: Vec<(String, Arc<dyn ForwardingFactory>)> = {
            let mut registry = self.lock_registry();
            let keys = registry
                .ports_by_connection
                .remove(&connection.id())
                .unwrap_or_default();
            keys.into_iter()
                .filter_map(|key| {
                    registry
                        .listening_ports
                        .remove(&key)
                        .map(|factory| (key, factory))
                })
                .collect()
        };
        if stopped.is_empty() {
            debug!("no forwards registered for {}", connection.id());
            return;
        }
        for (key, factory) in stopped {
            factory.stop_accepting(true);
            info!("forwarding stopped on {} for {}", key, connection.id());
            self.events.fire_event(
                Event::new(EventCode::ForwardingStopped)
                    .with_connection(connection.clone())
                    .with_attribute("key", key),
            );
        }
    }
}
