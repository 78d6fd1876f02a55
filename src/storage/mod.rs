//! Storage backends
//!
//! - Postgres: durable store with a native change feed (LISTEN/NOTIFY)
//! - Memory: in-process store for tests and development

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PostgresConfig, PostgresStore};

use crate::dispatch::ChangeEvent;
use crate::topics::Topic;
pub use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Storage errors
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Authoritative video record, keyed by id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelVideoRecord {
    pub id: String,
    pub title: String,
    pub author: String,
    pub channel_id: String,
    pub published_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub length_seconds: i32,
    pub is_live: bool,
    pub premiere_timestamp: Option<DateTime<Utc>>,
    pub view_count: i64,
}

/// Whether an upsert created the row or refreshed an existing one.
/// A downstream notification fires only on `Inserted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Persistent state the pipeline leans on
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or refresh a video record; reports which one happened
    async fn upsert_video(&self, record: &ChannelVideoRecord)
        -> Result<UpsertOutcome, StorageError>;

    /// Fetch a record by id
    async fn video(&self, id: &str) -> Result<Option<ChannelVideoRecord>, StorageError>;

    /// Mark a feed topic as actively subscribed (timestamp refresh)
    async fn mark_subscribed(&self, topic: &Topic, at: DateTime<Utc>)
        -> Result<(), StorageError>;

    /// When the topic was last confirmed by the hub, if ever
    async fn subscribed_at(&self, topic: &Topic)
        -> Result<Option<DateTime<Utc>>, StorageError>;

    /// Accounts following a channel (for inbox fan-out)
    async fn channel_subscribers(&self, channel_id: &str) -> Result<Vec<String>, StorageError>;

    /// Append a video id to an account's notification inbox.
    /// This path is at-least-once; readers deduplicate by id.
    async fn push_inbox(&self, account: &str, video_id: &str) -> Result<(), StorageError>;

    /// Read an account's inbox backlog, deduplicated
    async fn inbox(&self, account: &str) -> Result<Vec<String>, StorageError>;

    /// The store's native change feed: ChangeEvents for inserts committed by
    /// any process, this one included. `None` when the backend has no such
    /// mechanism.
    async fn changes(&self) -> Result<Option<mpsc::Receiver<ChangeEvent>>, StorageError>;
}
