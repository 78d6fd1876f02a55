//! feedhub: real-time push notification pipeline for subscription feeds.
//!
//! The hub delivers signed webhook callbacks when a followed channel or
//! playlist publishes; the ingest worker verifies, parses, and enriches each
//! entry against the upstream origin through a bounded connection pool, then
//! commits it to storage. True inserts become [`dispatch::ChangeEvent`]s
//! fanned out to live streaming subscribers, authorized by HMAC-signed
//! capability tokens.
//!
//! ```text
//! hub -> webhook -> ingest -> store -> dispatcher -> SSE subscribers
//!                      |
//!                      +-> upstream pool (metadata enrichment)
//! ```

pub mod auth;
pub mod dispatch;
pub mod hub;
pub mod server;
pub mod storage;
pub mod topics;
pub mod upstream;
