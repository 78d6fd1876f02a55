//! Failure-mode and load-shape tests: stalled subscribers, duplicate
//! deliveries, registration churn, pool contention

use chrono::Utc;
use feedhub::dispatch::{self, ChangeEvent, SUBSCRIBER_BUFFER};
use feedhub::hub::spawn_ingestor;
use feedhub::storage::{MemoryStore, Store};
use feedhub::upstream::{
    MetadataClient, PoolConfig, PoolMode, UpstreamError, UpstreamPool, VideoMetadata,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

struct StubClient;

#[async_trait::async_trait]
impl MetadataClient for StubClient {
    async fn video(&self, id: &str) -> Result<VideoMetadata, UpstreamError> {
        Ok(VideoMetadata {
            id: id.to_string(),
            title: "t".to_string(),
            author: "a".to_string(),
            channel_id: "UCstub".to_string(),
            published: 1_709_290_800,
            length_seconds: 1,
            is_live: false,
            premiere_timestamp: None,
            view_count: 0,
        })
    }
}

fn event(topic: &str, video: &str) -> ChangeEvent {
    ChangeEvent {
        topic: topic.to_string(),
        video_id: video.to_string(),
        published_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_stalled_subscriber_does_not_stall_siblings() {
    let dispatcher = dispatch::spawn();

    // The stalled subscriber never drains; its buffer fills and overflow
    // events are dropped for it alone.
    let (stalled_tx, _stalled_rx_kept_alive) = mpsc::channel(SUBSCRIBER_BUFFER);
    let (healthy_tx, mut healthy_rx) = mpsc::channel(SUBSCRIBER_BUFFER * 4);
    dispatcher.register(Uuid::new_v4(), vec!["t".to_string()], stalled_tx);
    dispatcher.register(Uuid::new_v4(), vec!["t".to_string()], healthy_tx);

    let total = SUBSCRIBER_BUFFER * 2;
    for i in 0..total {
        dispatcher.publish(event("t", &format!("vid-{}", i)));
    }

    // The healthy subscriber sees every event, in order
    for i in 0..total {
        let got = timeout(Duration::from_secs(2), healthy_rx.recv())
            .await
            .expect("healthy subscriber starved")
            .unwrap();
        assert_eq!(got.video_id, format!("vid-{}", i));
    }

    // Both subscribers are still registered
    let stats = dispatcher.stats().await;
    assert_eq!(stats.subscribers, 2);
}

#[tokio::test]
async fn test_duplicate_delivery_end_to_end_single_event() {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = dispatch::spawn();

    let mut changes = store.changes().await.unwrap().unwrap();
    let bridge = dispatcher.clone();
    tokio::spawn(async move {
        while let Some(event) = changes.recv().await {
            bridge.publish(event);
        }
    });

    let (tx, mut rx) = mpsc::channel(SUBSCRIBER_BUFFER);
    dispatcher.register(Uuid::new_v4(), vec!["UCstub".to_string()], tx);
    dispatcher.stats().await;

    let queue = spawn_ingestor(
        store.clone() as Arc<dyn Store>,
        Arc::new(StubClient),
        dispatcher.clone(),
        false,
    );

    let body = "<feed><entry><videoId>vid-dup</videoId><channelId>UCstub</channelId>\
                <title>t</title><author><name>n</name></author></entry></feed>";
    assert!(queue.enqueue(body.into()));
    assert!(queue.enqueue(body.into()));

    let first = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no event")
        .unwrap();
    assert_eq!(first.video_id, "vid-dup");

    // The redelivery is an update, not an insert: the live path stays quiet
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_rapid_register_unregister_churn() {
    let dispatcher = dispatch::spawn();

    for round in 0..100 {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        dispatcher.register(id, vec![format!("UC{}", round % 7)], tx);
        dispatcher.publish(event(&format!("UC{}", round % 7), "vid"));
        drop(rx);
        dispatcher.unregister(id);
    }

    let stats = dispatcher.stats().await;
    assert_eq!(stats.subscribers, 0);
    assert_eq!(stats.topics, 0);
}

#[tokio::test]
async fn test_pool_contention_many_tasks_few_handles() {
    let pool = UpstreamPool::new(PoolConfig {
        capacity: 3,
        mode: PoolMode::Single,
        lease_timeout: None,
        request_timeout: Duration::from_secs(1),
    })
    .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..30 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let _lease = pool.lease().await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }));
    }

    // Every task eventually gets a handle; no lease is lost or leaked
    for task in tasks {
        timeout(Duration::from_secs(5), task)
            .await
            .expect("task starved under contention")
            .unwrap();
    }
    assert_eq!(pool.available(), 3);
}
