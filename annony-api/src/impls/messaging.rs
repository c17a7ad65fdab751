//! Message handling shared by every streaming transport
//!
//! `MessageService` owns the submit/history operations. `ChatSession` runs one
//! client connection: it attaches to the local registry, forwards broadcasts
//! to the client and turns inbound events into submissions. Transports only
//! provide the `StreamMessage` IO adapter.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use annony_cluster::sync::{ClusterManager, Connection, ConnectionRegistry};
use annony_core::{
    config::ChatConfig,
    models::{ConnectionId, Message, SYSTEM_SENDER},
    repository::HistoryStore,
    Error, Result,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Body of the message written into an empty history
pub const WELCOME_TEXT: &str = "Welcome to AnnonyTalk!";

/// Validates, persists and broadcasts chat messages.
pub struct MessageService {
    store: Arc<dyn HistoryStore>,
    cluster: Arc<ClusterManager>,
    history_limit: usize,
    max_message_length: usize,
}

impl MessageService {
    #[must_use]
    pub fn new(store: Arc<dyn HistoryStore>, cluster: Arc<ClusterManager>, config: &ChatConfig) -> Self {
        Self {
            store,
            cluster,
            history_limit: config.history_limit,
            max_message_length: config.max_message_length,
        }
    }

    /// Accept a message from `connection_id`.
    ///
    /// The message is appended to the history first and only then published;
    /// a persistence failure rejects the submission and nothing is broadcast.
    /// Local clients, the sender included, receive it through the bus
    /// subscription like every other instance.
    pub async fn submit(&self, connection_id: &ConnectionId, text: &str) -> Result<Message> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::InvalidInput("Message text is empty".to_string()));
        }
        if text.chars().count() > self.max_message_length {
            return Err(Error::InvalidInput(format!(
                "Message too long (max {} characters)",
                self.max_message_length
            )));
        }

        let message = Message::from_connection(connection_id, text);
        let stored = self.store.append(message).await.map_err(|e| {
            error!(error = %e, connection_id = %connection_id, "Failed to persist message");
            Error::Persistence(e.to_string())
        })?;

        self.cluster.publish(&stored).await.map_err(|e| {
            error!(error = %e, connection_id = %connection_id, "Failed to publish message");
            Error::from(e)
        })?;

        debug!(connection_id = %connection_id, sender = %stored.sender, "Message submitted");
        Ok(stored)
    }

    /// The most recent messages, oldest first, capped at the history limit.
    pub async fn history(&self, limit: usize) -> Result<Vec<Message>> {
        self.store.list_recent(limit.min(self.history_limit)).await
    }

    #[must_use]
    pub const fn history_limit(&self) -> usize {
        self.history_limit
    }

    /// Write the welcome message if the history is empty. Returns whether it did.
    pub async fn seed_welcome(&self) -> Result<bool> {
        if !self.store.is_empty().await? {
            return Ok(false);
        }
        self.store
            .append(Message::with_sender(SYSTEM_SENDER, WELCOME_TEXT, Utc::now()))
            .await?;
        info!("Seeded empty history with welcome message");
        Ok(true)
    }
}

/// Events sent by clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    SendMessage { text: String },
}

/// Events sent to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    ReceiveMessage {
        text: String,
        sender: String,
        time: String,
    },
    LoadHistory {
        messages: Vec<Message>,
    },
    Error {
        error: String,
    },
}

impl From<&Message> for ServerEvent {
    fn from(message: &Message) -> Self {
        Self::ReceiveMessage {
            text: message.text.clone(),
            sender: message.sender.clone(),
            time: message.time.clone(),
        }
    }
}

/// JSON text-frame codec for stream events
pub struct EventCodec;

impl EventCodec {
    pub fn decode_client_event(text: &str) -> std::result::Result<ClientEvent, String> {
        serde_json::from_str(text).map_err(|e| format!("Invalid client event: {e}"))
    }

    pub fn encode_server_event(event: &ServerEvent) -> std::result::Result<String, String> {
        serde_json::to_string(event).map_err(|e| format!("Failed to encode server event: {e}"))
    }
}

/// Bidirectional IO for one client connection
#[async_trait::async_trait]
pub trait StreamMessage: Send + Sync {
    /// Next client event; `None` once the client is gone
    async fn recv(&mut self) -> Option<std::result::Result<ClientEvent, String>>;

    fn send(&self, event: ServerEvent) -> std::result::Result<(), String>;

    fn is_alive(&self) -> bool;
}

/// Runs a single client connection against the service and registry.
pub struct ChatSession {
    service: Arc<MessageService>,
    registry: Arc<ConnectionRegistry>,
    remote_addr: Option<SocketAddr>,
}

impl ChatSession {
    #[must_use]
    pub const fn new(
        service: Arc<MessageService>,
        registry: Arc<ConnectionRegistry>,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            service,
            registry,
            remote_addr,
        }
    }

    /// Serve the connection until the client leaves or the registry drops it.
    pub async fn run<S: StreamMessage>(&self, stream: &mut S) -> std::result::Result<(), String> {
        let connection = Connection::new(self.remote_addr);
        let connection_id = connection.id.clone();

        let mut outbound = match self.registry.attach(connection) {
            Ok(rx) => rx,
            Err(e) => {
                warn!(error = %e, remote_addr = ?self.remote_addr, "Connection refused");
                let _ = stream.send(ServerEvent::Error {
                    error: "Server is full, try again later".to_string(),
                });
                return Err(e.to_string());
            }
        };

        // Broadcasts queued between attach and the history read may already be
        // part of the snapshot; those are not delivered a second time.
        let mut in_history = HashSet::new();
        match self.service.history(self.service.history_limit()).await {
            Ok(messages) => {
                in_history = messages.iter().filter_map(|m| m.id.clone()).collect();
                stream.send(ServerEvent::LoadHistory { messages })?;
            }
            Err(e) => warn!(error = %e, connection_id = %connection_id, "Failed to load history for new connection"),
        }

        let result = self
            .message_loop(stream, &connection_id, &mut outbound, &mut in_history)
            .await;

        self.registry.begin_close(&connection_id);
        self.registry.detach(&connection_id);
        result
    }

    async fn message_loop<S: StreamMessage>(
        &self,
        stream: &mut S,
        connection_id: &ConnectionId,
        outbound: &mut tokio::sync::mpsc::Receiver<Message>,
        in_history: &mut HashSet<String>,
    ) -> std::result::Result<(), String> {
        loop {
            tokio::select! {
                event = stream.recv() => {
                    match event {
                        Some(Ok(ClientEvent::SendMessage { text })) => {
                            self.handle_send(stream, connection_id, &text).await?;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, connection_id = %connection_id, "Protocol error, closing connection");
                            return Err(e);
                        }
                        None => {
                            debug!(connection_id = %connection_id, "Client disconnected");
                            return Ok(());
                        }
                    }
                }

                message = outbound.recv() => {
                    let Some(message) = message else {
                        info!(connection_id = %connection_id, "Connection dropped by registry");
                        return Ok(());
                    };
                    let duplicate = message.id.as_ref().is_some_and(|id| in_history.remove(id));
                    if duplicate {
                        debug!(connection_id = %connection_id, "Skipping broadcast already sent in history");
                    } else {
                        stream.send(ServerEvent::from(&message))?;
                    }
                }

                () = tokio::time::sleep(Duration::from_secs(30)) => {
                    if !stream.is_alive() {
                        info!(connection_id = %connection_id, "Connection no longer alive");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_send<S: StreamMessage>(
        &self,
        stream: &S,
        connection_id: &ConnectionId,
        text: &str,
    ) -> std::result::Result<(), String> {
        match self.service.submit(connection_id, text).await {
            Ok(_) => Ok(()),
            // Blank submissions are dropped silently
            Err(Error::InvalidInput(_)) if text.trim().is_empty() => Ok(()),
            Err(Error::InvalidInput(reason)) => stream.send(ServerEvent::Error { error: reason }),
            Err(_) => stream.send(ServerEvent::Error {
                error: "Failed to send message".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use annony_cluster::sync::{ClusterConfig, LocalBus, MessageBus};
    use annony_core::repository::MemoryHistoryStore;
    use async_trait::async_trait;
    use mockall::mock;
    use tokio::time::timeout;

    mock! {
        Store {}

        #[async_trait]
        impl HistoryStore for Store {
            async fn append(&self, message: Message) -> Result<Message>;
            async fn list_recent(&self, limit: usize) -> Result<Vec<Message>>;
            async fn is_empty(&self) -> Result<bool>;
        }
    }

    async fn cluster(registry: &Arc<ConnectionRegistry>) -> Arc<ClusterManager> {
        let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::new());
        Arc::new(
            ClusterManager::start_with_bus(bus, ClusterConfig::default(), Arc::clone(registry))
                .await
                .unwrap(),
        )
    }

    async fn service_with(store: Arc<dyn HistoryStore>) -> (MessageService, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::default());
        let cluster = cluster(&registry).await;
        (MessageService::new(store, cluster, &ChatConfig::default()), registry)
    }

    #[tokio::test]
    async fn test_submit_persists_and_broadcasts() {
        let store = Arc::new(MemoryHistoryStore::new());
        let (service, registry) = service_with(store.clone()).await;
        let mut rx = registry.attach(Connection::new(None)).unwrap();

        let id = ConnectionId::from_string("a1b2c3d4e5f6g7h8".to_string());
        let message = service.submit(&id, "  hello  ").await.unwrap();

        assert_eq!(message.text, "hello");
        assert_eq!(message.sender, "Anon-a1b2");
        assert!(message.is_persisted());
        assert_eq!(store.len(), 1);

        let delivered = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(delivered, message);
    }

    #[tokio::test]
    async fn test_blank_text_rejected() {
        let store = Arc::new(MemoryHistoryStore::new());
        let (service, registry) = service_with(store.clone()).await;
        let mut rx = registry.attach(Connection::new(None)).unwrap();

        let id = ConnectionId::new();
        for text in ["", "   ", "\n\t"] {
            assert!(matches!(service.submit(&id, text).await, Err(Error::InvalidInput(_))));
        }
        assert_eq!(store.len(), 0);
        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_overlong_text_rejected() {
        let (service, _registry) = service_with(Arc::new(MemoryHistoryStore::new())).await;
        let text = "x".repeat(501);
        assert!(matches!(
            service.submit(&ConnectionId::new(), &text).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_persistence_failure_blocks_broadcast() {
        let mut store = MockStore::new();
        store
            .expect_append()
            .times(1)
            .returning(|_| Err(Error::Persistence("connection refused".to_string())));
        let (service, registry) = service_with(Arc::new(store)).await;
        let mut rx = registry.attach(Connection::new(None)).unwrap();

        let result = service.submit(&ConnectionId::new(), "lost").await;
        assert!(matches!(result, Err(Error::Persistence(_))));
        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_history_is_capped() {
        let store = Arc::new(MemoryHistoryStore::new());
        let (service, _registry) = service_with(store).await;
        let id = ConnectionId::new();
        for i in 0..150 {
            service.submit(&id, &format!("m{i}")).await.unwrap();
        }

        let history = service.history(1000).await.unwrap();
        assert_eq!(history.len(), 100);
        assert_eq!(history.first().unwrap().text, "m50");
        assert_eq!(history.last().unwrap().text, "m149");

        assert_eq!(service.history(10).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_seed_welcome_only_when_empty() {
        let store = Arc::new(MemoryHistoryStore::new());
        let (service, _registry) = service_with(store.clone()).await;

        assert!(service.seed_welcome().await.unwrap());
        assert!(!service.seed_welcome().await.unwrap());

        let history = service.history(100).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].sender, SYSTEM_SENDER);
        assert_eq!(history[0].text, WELCOME_TEXT);
    }

    /// In-memory transport: the test feeds inbound events and reads what the
    /// session sent.
    struct ChannelStream {
        inbound: tokio::sync::mpsc::Receiver<std::result::Result<ClientEvent, String>>,
        sent: tokio::sync::mpsc::UnboundedSender<ServerEvent>,
    }

    #[async_trait]
    impl StreamMessage for ChannelStream {
        async fn recv(&mut self) -> Option<std::result::Result<ClientEvent, String>> {
            self.inbound.recv().await
        }

        fn send(&self, event: ServerEvent) -> std::result::Result<(), String> {
            self.sent.send(event).map_err(|e| e.to_string())
        }

        fn is_alive(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_message_in_history_snapshot_is_not_redelivered() {
        let registry = Arc::new(ConnectionRegistry::default());
        let cluster = cluster(&registry).await;

        let mut racing = Message::with_sender("Anon-a1b2", "raced", Utc::now());
        racing.id = Some("raced-id".to_string());

        // The broadcast lands in the new connection's queue while its history
        // is being read, and the history already contains it
        let mut store = MockStore::new();
        let broadcaster = Arc::clone(&registry);
        let snapshot = racing.clone();
        store.expect_list_recent().times(1).returning(move |_| {
            broadcaster.broadcast_local(&snapshot);
            Ok(vec![snapshot.clone()])
        });
        let service = Arc::new(MessageService::new(Arc::new(store), cluster, &ChatConfig::default()));

        let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(8);
        let (sent_tx, mut sent_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut stream = ChannelStream {
            inbound: inbound_rx,
            sent: sent_tx,
        };
        let session = ChatSession::new(service, Arc::clone(&registry), None);
        let handle = tokio::spawn(async move { session.run(&mut stream).await });

        let first = timeout(Duration::from_secs(1), sent_rx.recv()).await.unwrap().unwrap();
        assert_eq!(first, ServerEvent::LoadHistory { messages: vec![racing] });

        let mut later = Message::with_sender("Anon-c3d4", "after", Utc::now());
        later.id = Some("after-id".to_string());
        registry.broadcast_local(&later);

        let next = timeout(Duration::from_secs(1), sent_rx.recv()).await.unwrap().unwrap();
        assert_eq!(next, ServerEvent::from(&later));

        drop(inbound_tx);
        handle.await.unwrap().unwrap();
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn test_event_wire_format() {
        let event = EventCodec::decode_client_event(r#"{"event":"send_message","data":{"text":"hi"}}"#).unwrap();
        assert_eq!(event, ClientEvent::SendMessage { text: "hi".to_string() });

        let out = EventCodec::encode_server_event(&ServerEvent::ReceiveMessage {
            text: "hi".to_string(),
            sender: "Anon-a1b2".to_string(),
            time: "10:00:00".to_string(),
        })
        .unwrap();
        let json: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(json["event"], "receive_message");
        assert_eq!(json["data"]["sender"], "Anon-a1b2");

        assert!(EventCodec::decode_client_event(r#"{"event":"unknown"}"#).is_err());
    }
}
