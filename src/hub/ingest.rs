//! Delivery ingest worker
//!
//! The webhook handler acknowledges a delivery as soon as its signature
//! checks out, then hands the raw body to this worker through a bounded
//! queue. Entry processing is isolated: one entry's parse or fetch failure
//! never aborts its siblings, and every failure is logged where it happened.

use crate::dispatch::{ChangeEvent, DispatcherHandle};
use crate::hub::feed::{parse_feed, FeedEntry};
use crate::storage::{ChannelVideoRecord, StorageError, Store, UpsertOutcome};
use crate::upstream::{MetadataClient, UpstreamError};
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Deliveries queued ahead of the worker before new ones are dropped
pub const INGEST_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Error)]
enum IngestError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Producer side of the handoff between webhook handler and worker
#[derive(Clone)]
pub struct IngestQueue {
    tx: mpsc::Sender<Bytes>,
}

impl IngestQueue {
    /// Queue a delivery body; false means the queue was full and the
    /// delivery was dropped (the hub still gets its 200).
    pub fn enqueue(&self, body: Bytes) -> bool {
        match self.tx.try_send(body) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "ingest queue full, dropping delivery");
                false
            }
        }
    }
}

/// Spawn the ingest worker and return its queue handle.
///
/// `publish_direct` controls whether inserts publish straight to the
/// dispatcher; it is false when the store's own change feed is bridged in,
/// so each insert reaches live subscribers exactly once.
pub fn spawn_ingestor(
    store: Arc<dyn Store>,
    client: Arc<dyn MetadataClient>,
    dispatcher: DispatcherHandle,
    publish_direct: bool,
) -> IngestQueue {
    let (tx, rx) = mpsc::channel(INGEST_QUEUE_DEPTH);
    tokio::spawn(run(rx, store, client, dispatcher, publish_direct));
    IngestQueue { tx }
}

async fn run(
    mut rx: mpsc::Receiver<Bytes>,
    store: Arc<dyn Store>,
    client: Arc<dyn MetadataClient>,
    dispatcher: DispatcherHandle,
    publish_direct: bool,
) {
    while let Some(body) = rx.recv().await {
        let entries = match parse_feed(&body) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "discarding malformed delivery");
                continue;
            }
        };

        debug!(entries = entries.len(), "processing delivery");

        for entry in entries {
            let video_id = entry.video_id.clone();
            if let Err(e) = process_entry(&*store, &*client, &dispatcher, entry, publish_direct)
                .await
            {
                // Isolated: siblings in the same delivery still process
                warn!(video_id = %video_id, error = %e, "entry processing failed");
            }
        }
    }

    debug!("ingest worker stopped");
}

async fn process_entry(
    store: &dyn Store,
    client: &dyn MetadataClient,
    dispatcher: &DispatcherHandle,
    entry: FeedEntry,
    publish_direct: bool,
) -> Result<(), IngestError> {
    // The entry announces the id; the origin stays authoritative for the rest
    let metadata = client.video(&entry.video_id).await?;

    let published_at = entry
        .published
        .or_else(|| Utc.timestamp_opt(metadata.published, 0).single())
        .unwrap_or_else(Utc::now);

    let record = ChannelVideoRecord {
        id: metadata.id.clone(),
        title: metadata.title,
        author: metadata.author,
        channel_id: entry
            .channel_id
            .clone()
            .unwrap_or_else(|| metadata.channel_id.clone()),
        published_at,
        updated_at: entry.updated.unwrap_or_else(Utc::now),
        length_seconds: metadata.length_seconds,
        is_live: metadata.is_live,
        premiere_timestamp: metadata
            .premiere_timestamp
            .and_then(|t| Utc.timestamp_opt(t, 0).single()),
        view_count: metadata.view_count,
    };

    // Only a true insert notifies; metadata refreshes stay silent
    if store.upsert_video(&record).await? == UpsertOutcome::Updated {
        return Ok(());
    }

    info!(video_id = %record.id, channel = %record.channel_id, "new video ingested");

    if publish_direct {
        dispatcher.publish(ChangeEvent {
            topic: record.channel_id.clone(),
            video_id: record.id.clone(),
            published_at: record.published_at,
        });
    }

    // Denormalized inbox backlog, at-least-once and independent of the
    // live dispatcher path
    let subscribers = store.channel_subscribers(&record.channel_id).await?;
    for account in subscribers {
        if let Err(e) = store.push_inbox(&account, &record.id).await {
            warn!(account = %account, video_id = %record.id, error = %e, "inbox append failed");
        }
    }

    Ok(())
}
