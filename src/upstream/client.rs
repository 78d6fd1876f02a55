//! Opaque metadata client for the upstream origin
//!
//! Scraping and response shapes live behind [`MetadataClient`]; the rest of
//! the pipeline only ever sees typed records.

use crate::upstream::{PoolError, UpstreamPool};
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream request timed out")]
    Timeout,

    #[error("upstream resource not found: {0}")]
    NotFound(String),

    #[error("upstream returned status {0}")]
    Status(u16),

    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("upstream response decode error: {0}")]
    Decode(String),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Authoritative metadata for one video, as served by the origin API
#[derive(Debug, Clone, Deserialize)]
pub struct VideoMetadata {
    #[serde(rename = "videoId")]
    pub id: String,
    pub title: String,
    pub author: String,
    #[serde(rename = "authorId")]
    pub channel_id: String,
    /// Unix seconds
    pub published: i64,
    #[serde(rename = "lengthSeconds", default)]
    pub length_seconds: i32,
    #[serde(rename = "liveNow", default)]
    pub is_live: bool,
    #[serde(rename = "premiereTimestamp", default)]
    pub premiere_timestamp: Option<i64>,
    #[serde(rename = "viewCount", default)]
    pub view_count: i64,
}

/// Typed access to upstream video metadata
#[async_trait]
pub trait MetadataClient: Send + Sync {
    async fn video(&self, id: &str) -> Result<VideoMetadata, UpstreamError>;
}

/// Pool-backed implementation talking to the origin's JSON API
pub struct HttpMetadataClient {
    pool: UpstreamPool,
    base_url: String,
}

impl HttpMetadataClient {
    pub fn new(pool: UpstreamPool, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { pool, base_url }
    }
}

#[async_trait]
impl MetadataClient for HttpMetadataClient {
    async fn video(&self, id: &str) -> Result<VideoMetadata, UpstreamError> {
        let mut lease = self.pool.lease().await?;
        let url = format!("{}/videos/{}", self.base_url, id);

        // One budget covers send + body, independent of pool contention
        let result = timeout(self.pool.request_timeout(), async {
            let response = lease
                .client()
                .get(&url)
                .send()
                .await
                .map_err(|e| UpstreamError::Transport(e.to_string()))?;

            match response.status().as_u16() {
                200 => response
                    .json::<VideoMetadata>()
                    .await
                    .map_err(|e| UpstreamError::Decode(e.to_string())),
                404 => Err(UpstreamError::NotFound(id.to_string())),
                status => Err(UpstreamError::Status(status)),
            }
        })
        .await;

        match result {
            Ok(Ok(metadata)) => Ok(metadata),
            Ok(Err(e)) => {
                if matches!(e, UpstreamError::Transport(_)) {
                    lease.poison();
                }
                Err(e)
            }
            Err(_) => {
                // The handle may have a request wedged on it; replace it
                lease.poison();
                Err(UpstreamError::Timeout)
            }
        }
    }
}
