//! HTTP surface
//!
//! Webhook endpoints follow the hub's anti-retry-storm contract: a delivery
//! always gets its 200 once the signature check completes, valid or not.
//! Interactive endpoints return precise 4xx for auth/validation failures and
//! a uniform JSON error envelope `{"error": ...}`.

use crate::auth::TokenService;
use crate::dispatch::DispatcherHandle;
use crate::hub::{verify_hub_signature, IngestQueue, VerificationToken};
use crate::server::stream;
use crate::storage::{StorageError, Store};
use crate::topics::{parse_topic_list, Topic};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

/// Scope required to open a notification stream or read the inbox
pub const NOTIFICATIONS_SCOPE: &str = ":notifications";

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub tokens: Arc<TokenService>,
    pub dispatcher: DispatcherHandle,
    pub ingest: IngestQueue,
    pub hub_secret: Arc<Vec<u8>>,
}

/// Uniform external error shape; internal detail stays in the logs
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    NotFound,
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            ),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        warn!(error = %e, "storage error on api path");
        ApiError::Internal
    }
}

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/feed/webhook/{token}", get(confirm).post(deliver))
        .route("/notifications", get(notifications).post(notifications))
        .route("/inbox", get(inbox))
        .route("/videos/{id}", get(video))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct HubQuery {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.topic")]
    topic: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

/// Subscription confirmation: prove the callback URL, record the topic as
/// actively subscribed, echo the challenge.
async fn confirm(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(query): Query<HubQuery>,
) -> Result<String, ApiError> {
    let token = VerificationToken::parse(&token)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    token
        .verify(&state.hub_secret, Utc::now().timestamp())
        .map_err(|e| {
            warn!(error = %e, "confirmation rejected");
            ApiError::BadRequest("invalid verification token".to_string())
        })?;

    let mode = query
        .mode
        .ok_or_else(|| ApiError::BadRequest("missing hub.mode".to_string()))?;
    let topic_url = query
        .topic
        .ok_or_else(|| ApiError::BadRequest("missing hub.topic".to_string()))?;
    let challenge = query
        .challenge
        .ok_or_else(|| ApiError::BadRequest("missing hub.challenge".to_string()))?;

    let topic = Topic::from_topic_url(&topic_url)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    match mode.as_str() {
        "subscribe" => {
            state.store.mark_subscribed(&topic, Utc::now()).await?;
            debug!(topic = %topic, "subscription confirmed");
        }
        "unsubscribe" => {
            debug!(topic = %topic, "unsubscription confirmed");
        }
        other => {
            return Err(ApiError::BadRequest(format!("unknown hub.mode '{}'", other)));
        }
    }

    // Echoing the challenge both confirms the subscription and proves liveness
    Ok(challenge)
}

/// Content delivery: always 200 once the signature check completes, so a
/// rejected delivery never triggers a hub retry storm.
async fn deliver(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let token_ok = VerificationToken::parse(&token)
        .and_then(|t| t.verify(&state.hub_secret, Utc::now().timestamp()));
    if let Err(e) = token_ok {
        warn!(error = %e, "delivery with bad callback token, acking without processing");
        return StatusCode::OK;
    }

    let signature = headers
        .get("x-hub-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !verify_hub_signature(&state.hub_secret, signature, &body) {
        warn!("delivery signature mismatch, acking without processing");
        return StatusCode::OK;
    }

    // Ack now; parsing and fetching happen behind the queue
    state.ingest.enqueue(body);
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
struct NotificationsQuery {
    topics: Option<String>,
    // EventSource clients cannot set headers; allow the token inline
    token: Option<String>,
}

/// Open a live notification stream over the given topics
async fn notifications(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<NotificationsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers, query.token.as_deref(), NOTIFICATIONS_SCOPE)?;

    let raw = query
        .topics
        .ok_or_else(|| ApiError::BadRequest("missing topics".to_string()))?;
    let topics = parse_topic_list(&raw).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    Ok(stream::subscribe(state.dispatcher.clone(), topics))
}

/// Read the caller's notification backlog, deduplicated
async fn inbox(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<NotificationsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let subject = authorize(&state, &headers, query.token.as_deref(), NOTIFICATIONS_SCOPE)?;
    let video_ids = state.store.inbox(&subject).await?;
    Ok(Json(json!({ "videoIds": video_ids })))
}

/// Look up a stored video record
async fn video(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = state.store.video(&id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(serde_json::to_value(record).map_err(|e| {
        warn!(error = %e, "record serialization failed");
        ApiError::Internal
    })?))
}

/// Validate a bearer (or inline) token against a required scope.
/// All failure kinds collapse to one unauthorized outcome here; the token
/// service has already logged the distinct kind.
fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    inline_token: Option<&str>,
    required_scope: &str,
) -> Result<String, ApiError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or(inline_token)
        .ok_or(ApiError::Unauthorized)?;

    state
        .tokens
        .validate(token, required_scope)
        .map_err(|_| ApiError::Unauthorized)
}
