//! Active Connection Registry

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tracing::debug;

/// Tracking info for one proxied connection pair
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: u64,
    pub client_addr: SocketAddr,
    pub target_addr: SocketAddr,
    pub start_time: Instant,
}

/// Registry of currently active connection pairs.
///
/// Pump tasks remove their own pair on exit while `stop` may clear the whole
/// registry concurrently, so every operation takes the lock briefly and the
/// lock is never held across I/O.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<u64, ConnectionInfo>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection pair and return its id
    pub fn insert(&self, client_addr: SocketAddr, target_addr: SocketAddr) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let info = ConnectionInfo {
            id,
            client_addr,
            target_addr,
            start_time: Instant::now(),
        };

        let mut connections = self.connections.lock().unwrap();
        connections.insert(id, info);
        id
    }

    /// Remove a connection pair. Safe to call more than once for the same id;
    /// both pumps of a pair attempt removal and only the first succeeds.
    pub fn remove(&self, id: u64) {
        let mut connections = self.connections.lock().unwrap();
        if let Some(info) = connections.remove(&id) {
            debug!(
                "Connection {} from {} closed after {:?}",
                id,
                info.client_addr,
                info.start_time.elapsed()
            );
        }
    }

    /// Number of currently active connection pairs
    pub fn len(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Whether the registry has no active pairs
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all active connections
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        self.connections.lock().unwrap().values().cloned().collect()
    }

    /// Drop every tracked connection
    pub fn clear(&self) {
        let mut connections = self.connections.lock().unwrap();
        if !connections.is_empty() {
            debug!("Clearing {} tracked connections", connections.len());
        }
        connections.clear();
    }
}
