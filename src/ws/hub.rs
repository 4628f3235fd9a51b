use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::Message;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::ws::protocol::ServerMessage;

/// Type alias for the sender half of a WebSocket connection's channel.
/// Other parts of the system can clone this to push messages to a specific client.
pub type ConnectionSender = mpsc::UnboundedSender<Message>;

/// One registered endpoint of a user. The id distinguishes multiple
/// connections of the same user (multiple devices/tabs) so that unregister
/// removes exactly the connection that is going away.
#[derive(Debug, Clone)]
struct ConnectionHandle {
    id: u64,
    sender: ConnectionSender,
}

/// Connection registry: tracks all active WebSocket connections per user.
/// A user can have multiple concurrent connections; the map entry for a
/// username exists iff at least one connection is registered.
///
/// Writes to a connection never happen under a map lock — `send_to_user`
/// only queues onto an unbounded channel; the actual socket I/O is done by
/// the session's writer task.
pub struct Hub {
    connections: DashMap<String, Vec<ConnectionHandle>>,
    next_conn_id: AtomicU64,
    failed_writes: AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_conn_id: AtomicU64::new(1),
            failed_writes: AtomicU64::new(0),
        }
    }

    /// Register a connection sender for a user. Returns a guard that
    /// unregisters the connection when dropped, so cleanup is tied to the
    /// session's lifetime no matter how it exits.
    pub fn register(self: &Arc<Self>, username: &str, sender: ConnectionSender) -> Registration {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let mut conns = self.connections.entry(username.to_string()).or_default();
        conns.push(ConnectionHandle {
            id: conn_id,
            sender,
        });
        let conn_count = conns.len();
        drop(conns);

        tracing::debug!(
            username = %username,
            connections = conn_count,
            "Connection registered"
        );

        Registration {
            hub: self.clone(),
            username: username.to_string(),
            conn_id,
        }
    }

    /// Remove a connection from the registry. The username entry is removed
    /// entirely once its last connection goes away, so presence checks can
    /// rely on key existence. Calling this again for the same pair is a no-op.
    pub fn unregister(&self, username: &str, conn_id: u64) {
        let mut remove_user = false;

        if let Some(mut conns) = self.connections.get_mut(username) {
            conns.retain(|c| c.id != conn_id);
            if conns.is_empty() {
                remove_user = true;
            }
        }

        if remove_user {
            self.connections.remove_if(username, |_, conns| conns.is_empty());
        }

        tracing::debug!(
            username = %username,
            "Connection unregistered"
        );
    }

    /// Send a message to a specific user (all their connections).
    /// Best-effort: a connection whose channel is gone is skipped and counted;
    /// removal is left to that connection's own session loop.
    pub fn send_to_user(&self, username: &str, msg: &ServerMessage) {
        let Ok(text) = serde_json::to_string(msg) else {
            return;
        };

        if let Some(conns) = self.connections.get(username) {
            for conn in conns.iter() {
                if conn.sender.send(Message::Text(text.clone().into())).is_err() {
                    self.failed_writes.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// True iff the user has at least one active connection.
    pub fn is_online(&self, username: &str) -> bool {
        self.connections
            .get(username)
            .map(|conns| !conns.is_empty())
            .unwrap_or(false)
    }

    /// Number of active connections for a user.
    pub fn connection_count(&self, username: &str) -> usize {
        self.connections
            .get(username)
            .map(|conns| conns.len())
            .unwrap_or(0)
    }

    /// Number of users with at least one active connection.
    pub fn online_user_count(&self) -> usize {
        self.connections.len()
    }

    /// Total sends that found a closed connection channel.
    pub fn failed_writes(&self) -> u64 {
        self.failed_writes.load(Ordering::Relaxed)
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by `Hub::register`. Dropping it unregisters the
/// connection, exactly once.
pub struct Registration {
    hub: Arc<Hub>,
    username: String,
    conn_id: u64,
}

impl Registration {
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.hub.unregister(&self.username, self.conn_id);
    }
}
