use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};
use tracing::{error, info};

use crate::{
    config::DatabaseConfig,
    models::{generate_id, Message},
    Result,
};

/// Durable message history.
///
/// `append` assigns the record id. `list_recent` returns the newest `limit`
/// messages ordered oldest-first.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, message: Message) -> Result<Message>;

    async fn list_recent(&self, limit: usize) -> Result<Vec<Message>>;

    async fn is_empty(&self) -> Result<bool>;
}

/// `PostgreSQL`-backed history
#[derive(Clone)]
pub struct PgHistoryStore {
    pool: PgPool,
}

impl PgHistoryStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a connection pool for the configured database.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to database");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .connect(&config.url)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to connect to database");
                e
            })?;

        info!("Database connected successfully");
        Ok(Self::new(pool))
    }

    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_message(row: &PgRow) -> Result<Message> {
        let id: String = row.try_get("id")?;
        Ok(Message {
            id: Some(id.trim_end().to_string()),
            text: row.try_get("text")?,
            sender: row.try_get("sender")?,
            time: row.try_get("time")?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        })
    }
}

#[async_trait]
impl HistoryStore for PgHistoryStore {
    async fn append(&self, message: Message) -> Result<Message> {
        let row = sqlx::query(
            r"
            INSERT INTO messages (id, text, sender, time, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, text, sender, time, created_at
            ",
        )
        .bind(generate_id())
        .bind(&message.text)
        .bind(&message.sender)
        .bind(&message.time)
        .bind(message.created_at)
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_message(&row)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Message>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = sqlx::query(
            r"
            SELECT id, text, sender, time, created_at
            FROM messages
            ORDER BY created_at DESC, seq DESC
            LIMIT $1
            ",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows
            .iter()
            .map(Self::row_to_message)
            .collect::<Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    async fn is_empty(&self) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM messages)")
            .fetch_one(&self.pool)
            .await?;
        Ok(!exists)
    }
}

/// In-process history for single-node mode and tests.
///
/// Ordered by `created_at` whatever the order appends arrive in; keeps at
/// most `retention` messages and drops the oldest first.
pub struct MemoryHistoryStore {
    messages: Mutex<VecDeque<Message>>,
    retention: usize,
}

impl MemoryHistoryStore {
    pub const DEFAULT_RETENTION: usize = 10_000;

    #[must_use]
    pub fn new() -> Self {
        Self::with_retention(Self::DEFAULT_RETENTION)
    }

    #[must_use]
    pub fn with_retention(retention: usize) -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            retention: retention.max(1),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }
}

impl Default for MemoryHistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, mut message: Message) -> Result<Message> {
        message.id = Some(generate_id());

        let mut messages = self.messages.lock();
        // Concurrent submits stamp the time before taking the lock
        let at = messages.partition_point(|m| m.created_at <= message.created_at);
        messages.insert(at, message.clone());
        if messages.len() > self.retention {
            messages.pop_front();
        }
        Ok(message)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Message>> {
        let messages = self.messages.lock();
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.iter().skip(skip).cloned().collect())
    }

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.messages.lock().is_empty())
    }
}
