//! Client connections and the global connection registry
//!
//! A [`Connection`] is the abstract representation of one client across any
//! transport: the HTTP adapter builds one per inbound request, a socket
//! transport would build one per socket. Connections carry the mutable params
//! bag that routing populates and the pending-action counter that admission
//! control enforces.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::routes::Route;

/// JSON object type used for params bags throughout the crate
pub type JsonMap = Map<String, Value>;

// ============================================================================
// Connection
// ============================================================================

/// One client connection, shared between the transport layer and the
/// action pipeline.
#[derive(Debug)]
pub struct Connection {
    /// Globally unique for the connection's lifetime
    pub id: String,

    /// Stable per physical client across messages
    pub fingerprint: String,

    /// Transport type ("web", "test", ...)
    pub connection_type: String,

    /// Remote address as reported by the transport
    pub remote_ip: String,

    /// When the connection was created
    pub connected_at: DateTime<Utc>,

    params: RwLock<JsonMap>,
    matched_route: RwLock<Option<Route>>,
    rooms: RwLock<HashSet<String>>,
    pending_actions: AtomicUsize,
    total_actions: AtomicUsize,
}

impl Connection {
    /// Create a new connection for a transport.
    ///
    /// The fingerprint is derived from the remote address and user agent so
    /// repeated requests from the same physical client share it, while `id`
    /// is unique per connection.
    pub fn new(connection_type: impl Into<String>, remote_ip: impl Into<String>, user_agent: &str) -> Self {
        let remote_ip = remote_ip.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            fingerprint: fingerprint(&remote_ip, user_agent),
            connection_type: connection_type.into(),
            remote_ip,
            connected_at: Utc::now(),
            params: RwLock::new(JsonMap::new()),
            matched_route: RwLock::new(None),
            rooms: RwLock::new(HashSet::new()),
            pending_actions: AtomicUsize::new(0),
            total_actions: AtomicUsize::new(0),
        }
    }

    /// Snapshot of the current params bag
    pub async fn params(&self) -> JsonMap {
        self.params.read().await.clone()
    }

    /// Replace the whole params bag
    pub async fn set_params(&self, params: JsonMap) {
        *self.params.write().await = params;
    }

    /// Set a single param
    pub async fn set_param(&self, key: impl Into<String>, value: Value) {
        self.params.write().await.insert(key.into(), value);
    }

    /// Read a single param
    pub async fn param(&self, key: &str) -> Option<Value> {
        self.params.read().await.get(key).cloned()
    }

    /// Record the route that matched this connection, for introspection by
    /// actions (extension/MIME-type consumers read this).
    pub async fn set_matched_route(&self, route: Route) {
        *self.matched_route.write().await = Some(route);
    }

    /// The route that matched this connection, if any
    pub async fn matched_route(&self) -> Option<Route> {
        self.matched_route.read().await.clone()
    }

    /// Number of actions currently in flight on this connection
    pub fn pending_actions(&self) -> usize {
        self.pending_actions.load(Ordering::SeqCst)
    }

    /// Total number of actions this connection has started
    pub fn total_actions(&self) -> usize {
        self.total_actions.load(Ordering::SeqCst)
    }

    /// Mark one more action in flight
    pub fn increment_pending(&self) {
        self.pending_actions.fetch_add(1, Ordering::SeqCst);
        self.total_actions.fetch_add(1, Ordering::SeqCst);
    }

    /// Mark one action finished; the counter never goes below zero
    pub fn decrement_pending(&self) {
        let _ = self
            .pending_actions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Join a chat room
    pub async fn join_room(&self, room: impl Into<String>) {
        self.rooms.write().await.insert(room.into());
    }

    /// Leave a chat room
    pub async fn leave_room(&self, room: &str) -> bool {
        self.rooms.write().await.remove(room)
    }

    /// Rooms this connection currently belongs to
    pub async fn rooms(&self) -> HashSet<String> {
        self.rooms.read().await.clone()
    }
}

/// Derive a stable fingerprint for a physical client
fn fingerprint(remote_ip: &str, user_agent: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(remote_ip.as_bytes());
    hasher.update(b"|");
    hasher.update(user_agent.as_bytes());
    let digest = hasher.finalize();
    hex_prefix(&digest, 16)
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    bytes
        .iter()
        .take(len)
        .map(|b| format!("{b:02x}"))
        .collect()
}

// ============================================================================
// Connection Registry
// ============================================================================

/// Statistics about registered connections
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ConnectionStats {
    pub total: usize,
    pub by_type: HashMap<String, usize>,
}

/// Global registry of live connections
///
/// The transport layer registers a connection when it is created and destroys
/// it explicitly when the client goes away; destroying removes it from every
/// room it joined.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, returning the shared handle
    pub async fn add(&self, connection: Connection) -> Arc<Connection> {
        let connection = Arc::new(connection);
        self.connections
            .write()
            .await
            .insert(connection.id.clone(), connection.clone());
        connection
    }

    /// Look up a connection by id
    pub async fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.read().await.get(id).cloned()
    }

    /// Destroy a connection, removing it from the registry and from any rooms
    pub async fn destroy(&self, id: &str) -> bool {
        let removed = self.connections.write().await.remove(id);
        match removed {
            Some(connection) => {
                let rooms = connection.rooms().await;
                for room in rooms {
                    connection.leave_room(&room).await;
                }
                tracing::debug!(connection_id = %id, "connection destroyed");
                true
            }
            None => false,
        }
    }

    /// Number of live connections
    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Aggregate statistics by connection type
    pub async fn stats(&self) -> ConnectionStats {
        let connections = self.connections.read().await;
        let mut by_type: HashMap<String, usize> = HashMap::new();
        for connection in connections.values() {
            *by_type.entry(connection.connection_type.clone()).or_default() += 1;
        }
        ConnectionStats {
            total: connections.len(),
            by_type,
        }
    }
}
