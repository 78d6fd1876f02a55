//! In-memory storage backend (tests and development)

use crate::dispatch::ChangeEvent;
use crate::storage::{ChannelVideoRecord, StorageError, Store, UpsertOutcome};
use crate::topics::Topic;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Default)]
struct Inner {
    videos: HashMap<String, ChannelVideoRecord>,
    feed_subscriptions: HashMap<String, DateTime<Utc>>,
    channel_subscribers: HashMap<String, BTreeSet<String>>,
    inboxes: HashMap<String, Vec<String>>,
}

/// In-process store with the same change-feed contract as Postgres:
/// a fresh insert is visible on every receiver handed out by `changes()`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    change_feeds: Mutex<Vec<mpsc::Sender<ChangeEvent>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Follow a channel on behalf of an account
    pub fn add_channel_subscriber(&self, account: &str, channel_id: &str) {
        self.inner
            .lock()
            .channel_subscribers
            .entry(channel_id.to_string())
            .or_default()
            .insert(account.to_string());
    }

    fn broadcast(&self, event: ChangeEvent) {
        let mut feeds = self.change_feeds.lock();
        feeds.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Stalled reader loses this event; the feed itself stays live
                warn!(video_id = %event.video_id, "change feed full, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_video(
        &self,
        record: &ChannelVideoRecord,
    ) -> Result<UpsertOutcome, StorageError> {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.videos.insert(record.id.clone(), record.clone()).is_some() {
                UpsertOutcome::Updated
            } else {
                UpsertOutcome::Inserted
            }
        };

        if outcome == UpsertOutcome::Inserted {
            self.broadcast(ChangeEvent {
                topic: record.channel_id.clone(),
                video_id: record.id.clone(),
                published_at: record.published_at,
            });
        }

        Ok(outcome)
    }

    async fn video(&self, id: &str) -> Result<Option<ChannelVideoRecord>, StorageError> {
        Ok(self.inner.lock().videos.get(id).cloned())
    }

    async fn mark_subscribed(
        &self,
        topic: &Topic,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.inner
            .lock()
            .feed_subscriptions
            .insert(topic.id().to_string(), at);
        Ok(())
    }

    async fn subscribed_at(&self, topic: &Topic) -> Result<Option<DateTime<Utc>>, StorageError> {
        Ok(self.inner.lock().feed_subscriptions.get(topic.id()).copied())
    }

    async fn channel_subscribers(&self, channel_id: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .inner
            .lock()
            .channel_subscribers
            .get(channel_id)
            .map(|accounts| accounts.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn push_inbox(&self, account: &str, video_id: &str) -> Result<(), StorageError> {
        self.inner
            .lock()
            .inboxes
            .entry(account.to_string())
            .or_default()
            .push(video_id.to_string());
        Ok(())
    }

    async fn inbox(&self, account: &str) -> Result<Vec<String>, StorageError> {
        // At-least-once writes; deduplicate on read, first occurrence wins
        let inner = self.inner.lock();
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for id in inner.inboxes.get(account).into_iter().flatten() {
            if seen.insert(id.clone()) {
                out.push(id.clone());
            }
        }
        Ok(out)
    }

    async fn changes(&self) -> Result<Option<mpsc::Receiver<ChangeEvent>>, StorageError> {
        let (tx, rx) = mpsc::channel(256);
        self.change_feeds.lock().push(tx);
        Ok(Some(rx))
    }
}
