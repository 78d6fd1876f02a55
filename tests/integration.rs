//! End-to-end tests over the HTTP surface with the in-memory store

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use feedhub::auth::{ScopeSet, TokenService};
use feedhub::dispatch::{self, ChangeEvent, DispatcherHandle, SUBSCRIBER_BUFFER};
use chrono::Utc;
use feedhub::hub::{hub_signature, spawn_ingestor, VerificationToken, REPLAY_WINDOW_SECS};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use feedhub::server::{build_router, AppState};
use feedhub::storage::{MemoryStore, Store};
use feedhub::topics::Topic;
use feedhub::upstream::{MetadataClient, UpstreamError, VideoMetadata};
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tower::ServiceExt;
use uuid::Uuid;

const HUB_SECRET: &[u8] = b"integration-hub-secret";

/// Upstream stub serving deterministic metadata for any id
struct StubClient;

#[async_trait::async_trait]
impl MetadataClient for StubClient {
    async fn video(&self, id: &str) -> Result<VideoMetadata, UpstreamError> {
        Ok(VideoMetadata {
            id: id.to_string(),
            title: format!("title of {}", id),
            author: "Example Channel".to_string(),
            channel_id: "UCstub".to_string(),
            published: 1_709_290_800,
            length_seconds: 212,
            is_live: false,
            premiere_timestamp: None,
            view_count: 42,
        })
    }
}

struct Harness {
    router: Router,
    store: Arc<MemoryStore>,
    dispatcher: DispatcherHandle,
    tokens: Arc<TokenService>,
}

/// Wire the full pipeline the way the daemon does: the store's change feed
/// bridges into the dispatcher, so the ingest path does not publish directly.
async fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let tokens = Arc::new(TokenService::new(b"integration-token-secret".to_vec()));
    let dispatcher = dispatch::spawn();

    let mut changes = store.changes().await.unwrap().unwrap();
    let bridge = dispatcher.clone();
    tokio::spawn(async move {
        while let Some(event) = changes.recv().await {
            bridge.publish(event);
        }
    });

    let ingest = spawn_ingestor(
        store.clone() as Arc<dyn Store>,
        Arc::new(StubClient),
        dispatcher.clone(),
        false,
    );

    let state = AppState {
        store: store.clone(),
        tokens: tokens.clone(),
        dispatcher: dispatcher.clone(),
        ingest,
        hub_secret: Arc::new(HUB_SECRET.to_vec()),
    };

    Harness {
        router: build_router(state),
        store,
        dispatcher,
        tokens,
    }
}

fn callback_token() -> String {
    VerificationToken::generate(HUB_SECRET).to_string()
}

/// A correctly signed v2 token minted `age_secs` in the past
fn aged_callback_token(age_secs: i64) -> String {
    let time = Utc::now().timestamp() - age_secs;
    let mut mac = Hmac::<Sha256>::new_from_slice(HUB_SECRET).unwrap();
    mac.update(time.to_string().as_bytes());
    format!("v2:{}:{:x}", time, mac.finalize().into_bytes())
}

fn feed_body(video_id: &str) -> String {
    format!(
        "<feed><entry><videoId>{}</videoId><channelId>UCstub</channelId>\
         <title>t</title><author><name>n</name></author></entry></feed>",
        video_id
    )
}

fn notifications_token(tokens: &TokenService, subject: &str) -> String {
    let scopes: ScopeSet = [":notifications"].into_iter().collect();
    tokens.issue(subject, scopes, None).as_str().to_string()
}

async fn wait_for_video(store: &MemoryStore, id: &str) {
    timeout(Duration::from_secs(2), async {
        loop {
            if store.video(id).await.unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("video never committed");
}

#[tokio::test]
async fn test_health() {
    let h = harness().await;
    let response = h
        .router
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_confirmation_echoes_challenge_and_records_topic() {
    let h = harness().await;
    // topic url percent-encoded: https://example.com/feed?channel_id=UCabc
    let uri = format!(
        "/feed/webhook/{}?hub.mode=subscribe\
         &hub.topic=https%3A%2F%2Fexample.com%2Ffeed%3Fchannel_id%3DUCabc\
         &hub.challenge=challenge-123",
        callback_token()
    );

    let response = h
        .router
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"challenge-123");

    let topic = Topic::channel("UCabc").unwrap();
    assert!(h.store.subscribed_at(&topic).await.unwrap().is_some());
}

#[tokio::test]
async fn test_confirmation_rejects_bad_token() {
    let h = harness().await;

    // Valid shape, tampered time: signature no longer matches
    let tampered = match VerificationToken::generate(HUB_SECRET) {
        VerificationToken::V2 { time, signature } => format!("v2:{}:{}", time + 1, signature),
        _ => unreachable!(),
    };

    for token in ["not-a-token", tampered.as_str()] {
        let uri = format!(
            "/feed/webhook/{}?hub.mode=subscribe\
             &hub.topic=https%3A%2F%2Fexample.com%2Ffeed%3Fchannel_id%3DUCabc\
             &hub.challenge=x",
            token
        );
        let response = h
            .router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{token}");
    }
}

#[tokio::test]
async fn test_confirmation_rejects_token_outside_replay_window() {
    let h = harness().await;

    // Signature is valid; only the age disqualifies it
    let stale = aged_callback_token(REPLAY_WINDOW_SECS + 60);
    let uri = format!(
        "/feed/webhook/{}?hub.mode=subscribe\
         &hub.topic=https%3A%2F%2Fexample.com%2Ffeed%3Fchannel_id%3DUCabc\
         &hub.challenge=x",
        stale
    );

    let response = h
        .router
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let topic = Topic::channel("UCabc").unwrap();
    assert!(h.store.subscribed_at(&topic).await.unwrap().is_none());
}

#[tokio::test]
async fn test_delivery_reaches_live_subscriber() {
    let h = harness().await;

    let (tx, mut rx) = mpsc::channel::<ChangeEvent>(SUBSCRIBER_BUFFER);
    h.dispatcher
        .register(Uuid::new_v4(), vec!["UCstub".to_string()], tx);
    // Registration is ordered ahead of any publish once stats resolves
    h.dispatcher.stats().await;

    let body = feed_body("vid-live-1");
    let response = h
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/feed/webhook/{}", callback_token()))
                .header("x-hub-signature", hub_signature(HUB_SECRET, body.as_bytes()))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let event = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no event within deadline")
        .unwrap();
    assert_eq!(event.video_id, "vid-live-1");
    assert_eq!(event.topic, "UCstub");
}

#[tokio::test]
async fn test_delivery_bad_signature_acked_but_ignored() {
    let h = harness().await;

    let body = feed_body("vid-forged");
    let response = h
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/feed/webhook/{}", callback_token()))
                .header("x-hub-signature", "sha1=0000000000000000000000000000000000000000")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    // Still a 200: a rejected delivery must never trigger hub retries
    assert_eq!(response.status(), StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.store.video("vid-forged").await.unwrap().is_none());
}

#[tokio::test]
async fn test_delivery_bad_callback_token_acked_but_ignored() {
    let h = harness().await;

    let body = feed_body("vid-x");
    let response = h
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/feed/webhook/v2:1:bogus")
                .header("x-hub-signature", hub_signature(HUB_SECRET, body.as_bytes()))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.store.video("vid-x").await.unwrap().is_none());
}

#[tokio::test]
async fn test_notifications_requires_token_and_scope() {
    let h = harness().await;

    // No token at all
    let response = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/notifications?topics=UCabc")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Token without the required scope
    let scopes: ScopeSet = [":feed"].into_iter().collect();
    let wrong = h.tokens.issue("user-1", scopes, None);
    let response = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/notifications?topics=UCabc")
                .header(header::AUTHORIZATION, format!("Bearer {}", wrong.as_str()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_notifications_opens_event_stream() {
    let h = harness().await;
    let token = notifications_token(&h.tokens, "user-1");

    let response = h
        .router
        .oneshot(
            Request::builder()
                .uri(format!("/notifications?topics=UCabc,UCdef&token={}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(content_type.starts_with("text/event-stream"));
}

#[tokio::test]
async fn test_notifications_rejects_invalid_topic_list() {
    let h = harness().await;
    let token = notifications_token(&h.tokens, "user-1");

    let response = h
        .router
        .oneshot(
            Request::builder()
                .uri(format!("/notifications?topics=bad%20id&token={}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_inbox_backlog_after_delivery() {
    let h = harness().await;
    h.store.add_channel_subscriber("alice", "UCstub");

    let body = feed_body("vid-inbox-1");
    let response = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/feed/webhook/{}", callback_token()))
                .header("x-hub-signature", hub_signature(HUB_SECRET, body.as_bytes()))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    wait_for_video(&h.store, "vid-inbox-1").await;

    let token = notifications_token(&h.tokens, "alice");
    let response = h
        .router
        .oneshot(
            Request::builder()
                .uri("/inbox")
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["videoIds"], serde_json::json!(["vid-inbox-1"]));
}

#[tokio::test]
async fn test_video_lookup() {
    let h = harness().await;

    let response = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/videos/missing")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let body = feed_body("vid-look-1");
    h.router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/feed/webhook/{}", callback_token()))
                .header("x-hub-signature", hub_signature(HUB_SECRET, body.as_bytes()))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    wait_for_video(&h.store, "vid-look-1").await;

    let response = h
        .router
        .oneshot(
            Request::builder()
                .uri("/videos/vid-look-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["id"], "vid-look-1");
    assert_eq!(parsed["channel_id"], "UCstub");
}
