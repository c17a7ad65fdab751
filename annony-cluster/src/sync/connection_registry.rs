use annony_core::models::{ConnectionId, Message};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::bridge::MessageHandler;
use crate::{Error, Result};

/// Lifecycle of a client connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Open | Self::Closed)
                | (Self::Open, Self::Closing | Self::Closed)
                | (Self::Closing, Self::Closed)
        )
    }
}

/// A client connection owned by one instance's registry
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub remote_addr: Option<SocketAddr>,
    pub state: ConnectionState,
    pub attached_at: DateTime<Utc>,
}

impl Connection {
    /// A new connection in the `Connecting` state with a fresh id
    #[must_use]
    pub fn new(remote_addr: Option<SocketAddr>) -> Self {
        Self::with_id(ConnectionId::new(), remote_addr)
    }

    #[must_use]
    pub fn with_id(id: ConnectionId, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            id,
            remote_addr,
            state: ConnectionState::Connecting,
            attached_at: Utc::now(),
        }
    }

    fn transition(&mut self, next: ConnectionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::ConnectionRejected(format!(
                "invalid transition {:?} -> {:?} for {}",
                self.state, next, self.id
            )));
        }
        self.state = next;
        Ok(())
    }
}

/// Registry limits
#[derive(Debug, Clone)]
pub struct ConnectionLimits {
    /// Maximum attached connections
    pub max_connections: usize,

    /// Outbound messages buffered per connection before it is dropped as slow
    pub queue_capacity: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            queue_capacity: 1000,
        }
    }
}

struct Entry {
    connection: Connection,
    sender: mpsc::Sender<Message>,
    delivered: AtomicU64,
}

/// Per-instance table of live connections.
///
/// Every operation runs under one lock, so attach, detach and broadcast are
/// linearizable: a broadcast either sees a connection as attached and
/// enqueues to it, or does not see it at all. Delivery is a non-blocking
/// enqueue onto each connection's bounded queue.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Entry>>,
    limits: ConnectionLimits,
    total_attached: AtomicU64,
    total_delivered: AtomicU64,
    total_dropped_slow: AtomicU64,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new(limits: ConnectionLimits) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            limits,
            total_attached: AtomicU64::new(0),
            total_delivered: AtomicU64::new(0),
            total_dropped_slow: AtomicU64::new(0),
        }
    }

    /// Attach a `Connecting` connection and move it to `Open`.
    ///
    /// Returns the receiving end of the connection's outbound queue. Rejected
    /// when the registry is full or the id is already attached.
    pub fn attach(&self, mut connection: Connection) -> Result<mpsc::Receiver<Message>> {
        let mut connections = self.connections.write();

        if connections.len() >= self.limits.max_connections {
            return Err(Error::ConnectionRejected(format!(
                "Server at capacity ({} connections)",
                self.limits.max_connections
            )));
        }
        if connections.contains_key(&connection.id) {
            return Err(Error::ConnectionRejected(format!(
                "connection id already attached: {}",
                connection.id
            )));
        }

        connection.transition(ConnectionState::Open)?;

        let (sender, receiver) = mpsc::channel(self.limits.queue_capacity);
        let id = connection.id.clone();
        let remote_addr = connection.remote_addr;
        connections.insert(
            id.clone(),
            Entry {
                connection,
                sender,
                delivered: AtomicU64::new(0),
            },
        );
        self.total_attached.fetch_add(1, Ordering::Relaxed);

        info!(
            connection_id = %id,
            remote_addr = ?remote_addr,
            active_connections = connections.len(),
            "Connection attached"
        );

        Ok(receiver)
    }

    /// Stop delivering to a connection that is shutting down.
    ///
    /// Returns `false` if the connection is not attached or not `Open`.
    pub fn begin_close(&self, connection_id: &ConnectionId) -> bool {
        let mut connections = self.connections.write();
        connections
            .get_mut(connection_id)
            .is_some_and(|entry| entry.connection.transition(ConnectionState::Closing).is_ok())
    }

    /// Remove a connection, returning it in the `Closed` state.
    ///
    /// Dropping the entry closes the outbound queue, which ends the
    /// connection's writer once queued messages are flushed.
    pub fn detach(&self, connection_id: &ConnectionId) -> Option<Connection> {
        let entry = self.connections.write().remove(connection_id)?;
        let mut connection = entry.connection;
        connection.state = ConnectionState::Closed;

        info!(
            connection_id = %connection_id,
            duration_secs = (Utc::now() - connection.attached_at).num_seconds(),
            delivered = entry.delivered.load(Ordering::Relaxed),
            "Connection detached"
        );

        Some(connection)
    }

    /// Enqueue `message` for every `Open` connection.
    ///
    /// Connections whose queue is full or whose writer is gone are detached
    /// after the broadcast. Returns the number of connections enqueued to.
    pub fn broadcast_local(&self, message: &Message) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();

        {
            let connections = self.connections.read();
            for (id, entry) in connections.iter() {
                if entry.connection.state != ConnectionState::Open {
                    continue;
                }
                match entry.sender.try_send(message.clone()) {
                    Ok(()) => {
                        entry.delivered.fetch_add(1, Ordering::Relaxed);
                        delivered += 1;
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(connection_id = %id, "Outbound queue full, dropping slow connection");
                        self.total_dropped_slow.fetch_add(1, Ordering::Relaxed);
                        failed.push(id.clone());
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(connection_id = %id, "Writer gone, detaching connection");
                        failed.push(id.clone());
                    }
                }
            }
        }

        for id in &failed {
            self.begin_close(id);
            self.detach(id);
        }

        self.total_delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        debug!(sender = %message.sender, delivered = delivered, "Broadcast to local connections");
        delivered
    }

    #[must_use]
    pub fn state(&self, connection_id: &ConnectionId) -> Option<ConnectionState> {
        self.connections
            .read()
            .get(connection_id)
            .map(|entry| entry.connection.state)
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    #[must_use]
    pub fn metrics(&self) -> ConnectionMetrics {
        ConnectionMetrics {
            active_connections: self.connection_count(),
            total_attached: self.total_attached.load(Ordering::Relaxed),
            total_delivered: self.total_delivered.load(Ordering::Relaxed),
            total_dropped_slow: self.total_dropped_slow.load(Ordering::Relaxed),
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(ConnectionLimits::default())
    }
}

impl MessageHandler for ConnectionRegistry {
    fn handle(&self, message: &Message) {
        self.broadcast_local(message);
    }
}

/// Connection metrics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionMetrics {
    pub active_connections: usize,
    pub total_attached: u64,
    pub total_delivered: u64,
    pub total_dropped_slow: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn msg(text: &str) -> Message {
        Message::with_sender("Anon-test", text, Utc::now())
    }

    #[test]
    fn test_state_machine() {
        use ConnectionState::*;

        assert!(Connecting.can_transition_to(Open));
        assert!(Open.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));
        assert!(Open.can_transition_to(Closed));

        assert!(!Closed.can_transition_to(Open));
        assert!(!Closed.can_transition_to(Connecting));
        assert!(!Closing.can_transition_to(Open));
        assert!(!Open.can_transition_to(Connecting));
    }

    #[test]
    fn test_attach_opens_connection() {
        let registry = ConnectionRegistry::default();
        let conn = Connection::new(None);
        let id = conn.id.clone();

        let _rx = registry.attach(conn).unwrap();
        assert_eq!(registry.state(&id), Some(ConnectionState::Open));
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = ConnectionRegistry::default();
        let id = ConnectionId::from_string("abcdabcdabcdabcd".to_string());

        let _rx = registry.attach(Connection::with_id(id.clone(), None)).unwrap();
        let result = registry.attach(Connection::with_id(id, None));
        assert!(matches!(result, Err(Error::ConnectionRejected(_))));
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn test_capacity_limit() {
        let registry = ConnectionRegistry::new(ConnectionLimits {
            max_connections: 2,
            ..Default::default()
        });

        let _a = registry.attach(Connection::new(None)).unwrap();
        let _b = registry.attach(Connection::new(None)).unwrap();
        assert!(registry.attach(Connection::new(None)).is_err());
    }

    #[test]
    fn test_closed_connection_cannot_attach() {
        let registry = ConnectionRegistry::default();
        let mut conn = Connection::new(None);
        conn.state = ConnectionState::Closed;

        assert!(registry.attach(conn).is_err());
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_open_connections() {
        let registry = ConnectionRegistry::default();
        let mut rx_a = registry.attach(Connection::new(None)).unwrap();
        let mut rx_b = registry.attach(Connection::new(None)).unwrap();

        assert_eq!(registry.broadcast_local(&msg("hi")), 2);
        assert_eq!(rx_a.recv().await.unwrap().text, "hi");
        assert_eq!(rx_b.recv().await.unwrap().text, "hi");
        assert_eq!(registry.metrics().total_delivered, 2);
    }

    #[tokio::test]
    async fn test_closing_connection_is_skipped() {
        let registry = ConnectionRegistry::default();
        let conn = Connection::new(None);
        let id = conn.id.clone();
        let mut rx = registry.attach(conn).unwrap();

        assert!(registry.begin_close(&id));
        assert_eq!(registry.state(&id), Some(ConnectionState::Closing));
        assert!(!registry.begin_close(&id));

        assert_eq!(registry.broadcast_local(&msg("skipped")), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_detach_closes_queue() {
        let registry = ConnectionRegistry::default();
        let conn = Connection::new(None);
        let id = conn.id.clone();
        let mut rx = registry.attach(conn).unwrap();

        let closed = registry.detach(&id).unwrap();
        assert_eq!(closed.state, ConnectionState::Closed);
        assert!(registry.detach(&id).is_none());
        assert_eq!(registry.broadcast_local(&msg("late")), 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_slow_connection_detached() {
        let registry = ConnectionRegistry::new(ConnectionLimits {
            queue_capacity: 1,
            ..Default::default()
        });
        let slow = Connection::new(None);
        let slow_id = slow.id.clone();
        let _slow_rx = registry.attach(slow).unwrap();

        assert_eq!(registry.broadcast_local(&msg("one")), 1);
        assert_eq!(registry.broadcast_local(&msg("two")), 0);

        assert!(registry.state(&slow_id).is_none());
        assert_eq!(registry.metrics().total_dropped_slow, 1);
    }

    #[tokio::test]
    async fn test_dropped_receiver_detached_on_broadcast() {
        let registry = ConnectionRegistry::default();
        let rx = registry.attach(Connection::new(None)).unwrap();
        drop(rx);

        assert_eq!(registry.broadcast_local(&msg("x")), 0);
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_detach_and_broadcast() {
        let registry = Arc::new(ConnectionRegistry::default());
        let mut handles = Vec::new();

        for _ in 0..50 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let conn = Connection::new(None);
                let id = conn.id.clone();
                let mut rx = registry.attach(conn).unwrap();
                tokio::task::yield_now().await;
                registry.detach(&id);
                // After detach the queue only drains what was enqueued before
                while rx.recv().await.is_some() {}
                assert!(registry.state(&id).is_none());
            }));
        }
        for _ in 0..50 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.broadcast_local(&msg("race"));
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.metrics().total_attached, 50);
    }
}
