//! Hub verification tokens
//!
//! Each webhook callback URL embeds a verification token tying the callback
//! to this process's hub secret:
//!
//! - `v1:<time>:<nonce>:<hex sig>` where sig = HMAC-SHA256(secret, "time:nonce")
//! - `v2:<time>:<hex sig>`         where sig = HMAC-SHA256(secret, "time")
//!
//! A token is valid iff its signature matches and its timestamp is within
//! the 5-day replay window.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use std::fmt;
use thiserror::Error;

/// Replay window: callbacks minted more than 5 days ago are rejected
pub const REPLAY_WINDOW_SECS: i64 = 432_000;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerificationError {
    #[error("malformed verification token")]
    Malformed,

    #[error("invalid verification token signature")]
    InvalidSignature,

    #[error("verification token outside replay window")]
    ReplayWindowExceeded,
}

/// A parsed verification token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationToken {
    V1 {
        time: i64,
        nonce: String,
        signature: String,
    },
    V2 {
        time: i64,
        signature: String,
    },
}

impl VerificationToken {
    /// Mint a fresh v2 token for an outgoing subscription request
    pub fn generate(secret: &[u8]) -> Self {
        let time = Utc::now().timestamp();
        Self::V2 {
            signature: sign(secret, &time.to_string()),
            time,
        }
    }

    /// Mint a v1 token with a random nonce (legacy links still carry these)
    pub fn generate_v1(secret: &[u8]) -> Self {
        let time = Utc::now().timestamp();
        let mut bytes = [0u8; 8];
        rand::rng().fill(&mut bytes);
        let nonce = URL_SAFE_NO_PAD.encode(bytes);
        Self::V1 {
            signature: sign(secret, &format!("{}:{}", time, nonce)),
            time,
            nonce,
        }
    }

    pub fn parse(token: &str) -> Result<Self, VerificationError> {
        let mut parts = token.split(':');
        let version = parts.next().ok_or(VerificationError::Malformed)?;
        match version {
            "v1" => {
                let time = next_time(&mut parts)?;
                let nonce = parts.next().ok_or(VerificationError::Malformed)?;
                let signature = parts.next().ok_or(VerificationError::Malformed)?;
                if parts.next().is_some() || nonce.is_empty() {
                    return Err(VerificationError::Malformed);
                }
                Ok(Self::V1 {
                    time,
                    nonce: nonce.to_string(),
                    signature: signature.to_string(),
                })
            }
            "v2" => {
                let time = next_time(&mut parts)?;
                let signature = parts.next().ok_or(VerificationError::Malformed)?;
                if parts.next().is_some() {
                    return Err(VerificationError::Malformed);
                }
                Ok(Self::V2 {
                    time,
                    signature: signature.to_string(),
                })
            }
            _ => Err(VerificationError::Malformed),
        }
    }

    pub fn time(&self) -> i64 {
        match self {
            Self::V1 { time, .. } | Self::V2 { time, .. } => *time,
        }
    }

    /// Verify signature and replay window
    pub fn verify(&self, secret: &[u8], now: i64) -> Result<(), VerificationError> {
        let (message, signature) = match self {
            Self::V1 {
                time,
                nonce,
                signature,
            } => (format!("{}:{}", time, nonce), signature),
            Self::V2 { time, signature } => (time.to_string(), signature),
        };

        if !constant_time_eq(&sign(secret, &message), signature) {
            return Err(VerificationError::InvalidSignature);
        }

        if now - self.time() > REPLAY_WINDOW_SECS {
            return Err(VerificationError::ReplayWindowExceeded);
        }

        Ok(())
    }
}

impl fmt::Display for VerificationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V1 {
                time,
                nonce,
                signature,
            } => write!(f, "v1:{}:{}:{}", time, nonce, signature),
            Self::V2 { time, signature } => write!(f, "v2:{}:{}", time, signature),
        }
    }
}

fn next_time(parts: &mut std::str::Split<'_, char>) -> Result<i64, VerificationError> {
    parts
        .next()
        .and_then(|t| t.parse().ok())
        .ok_or(VerificationError::Malformed)
}

fn sign(secret: &[u8], message: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(message.as_bytes());
    format!("{:x}", mac.finalize().into_bytes())
}

/// Constant-time comparison to prevent timing attacks
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}
