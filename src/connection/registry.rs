//! Connection bookkeeping shared by the accept loop and connection tasks.
//!
//! The registry is the only state shared between connections. Each
//! connection holds a [`RegistrationGuard`]; dropping it removes the entry,
//! so a connection leaves the registry exactly once however its loop ends.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Stable identifier of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer: SocketAddr,
    pub connected_at: Instant,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: Mutex<HashMap<ConnId, ConnectionInfo>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection and returns its id.
    pub fn register(&self, peer: SocketAddr) -> ConnId {
        let id = ConnId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.connections.lock().insert(
            id,
            ConnectionInfo {
                peer,
                connected_at: Instant::now(),
            },
        );
        trace!(conn = %id, client = %peer, "Registered connection");
        id
    }

    /// Registers a connection that is removed again when the guard drops.
    pub fn register_guarded(self: &Arc<Self>, peer: SocketAddr) -> RegistrationGuard {
        RegistrationGuard {
            id: self.register(peer),
            registry: Arc::clone(self),
        }
    }

    /// Removes a connection. Returns `false`, and logs the inconsistency, if
    /// it was not registered.
    pub fn deregister(&self, id: ConnId) -> bool {
        let removed = self.connections.lock().remove(&id).is_some();
        if removed {
            trace!(conn = %id, "Deregistered connection");
        } else {
            warn!(conn = %id, "Deregistering a connection that is not registered");
        }
        removed
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.connections.lock().contains_key(&id)
    }

    pub fn get(&self, id: ConnId) -> Option<ConnectionInfo> {
        self.connections.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keeps a connection registered for as long as it lives.
#[derive(Debug)]
pub struct RegistrationGuard {
    id: ConnId,
    registry: Arc<ConnectionRegistry>,
}

impl RegistrationGuard {
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Time since the connection was registered.
    pub fn connected_for(&self) -> Duration {
        self.registry
            .get(self.id)
            .map(|info| info.connected_at.elapsed())
            .unwrap_or_default()
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}
