//! Webhook hub protocol
//!
//! Subscription confirmations and content deliveries arrive from the hub on
//! callback URLs minted by this process. Confirmations prove the callback
//! URL with a verification token; deliveries sign the raw body with
//! `X-Hub-Signature: sha1=<hex>`.

mod feed;
mod ingest;
mod verification;

pub use feed::{parse_feed, FeedEntry, FeedError};
pub use ingest::{spawn_ingestor, IngestQueue, INGEST_QUEUE_DEPTH};
pub use verification::{VerificationError, VerificationToken, REPLAY_WINDOW_SECS};

use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Compute the delivery signature for a raw body
pub fn hub_signature(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha1::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(body);
    format!("sha1={:x}", mac.finalize().into_bytes())
}

/// Verify an `X-Hub-Signature` header against the full raw body
pub fn verify_hub_signature(secret: &[u8], header: &str, body: &[u8]) -> bool {
    verification::constant_time_eq(&hub_signature(secret, body), &header.to_ascii_lowercase())
}
