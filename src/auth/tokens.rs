//! Signed capability tokens
//!
//! Wire form: `cap-<base64url(payload json)>.<base64url(hmac-sha256 tag)>`
//!
//! Validation order is fixed: full-tag comparison first, then expiry, then
//! scope membership. Each failure kind is logged with its distinct kind; the
//! API layer collapses all of them to a single unauthorized response.

use crate::auth::scopes::ScopeSet;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Token prefix
pub const TOKEN_PREFIX: &str = "cap-";

/// Default lifetime of a CSRF token
pub const CSRF_DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("invalid token format")]
    InvalidFormat,

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("token expired")]
    Expired,

    #[error("token does not carry scope '{required}'")]
    ScopeDenied { required: String },

    #[error("single-use token already consumed")]
    NonceReplayed,

    #[error("token decode error: {0}")]
    DecodeError(String),
}

/// Payload signed into a capability token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPayload {
    /// Subject the token was issued to (user id or session id)
    pub subject: String,
    /// Scopes carried verbatim
    pub scopes: ScopeSet,
    /// Issue time, unix seconds
    pub issued_at: i64,
    /// Expiry, unix seconds; `None` means the token never expires
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    /// Single-use nonce, present only on nonce-bound CSRF tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// A signed capability token
#[derive(Debug, Clone)]
pub struct SignedToken {
    token: String,
    payload: TokenPayload,
}

impl SignedToken {
    pub fn as_str(&self) -> &str {
        &self.token
    }

    pub fn subject(&self) -> &str {
        &self.payload.subject
    }

    pub fn scopes(&self) -> &ScopeSet {
        &self.payload.scopes
    }

    pub fn expires_at(&self) -> Option<i64> {
        self.payload.expires_at
    }

    pub fn nonce(&self) -> Option<&str> {
        self.payload.nonce.as_deref()
    }
}

impl fmt::Display for SignedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token)
    }
}

/// Remembers consumed single-use nonces until their token's own expiry
#[derive(Default)]
pub struct NonceRegistry {
    // nonce -> expiry unix seconds (i64::MAX for non-expiring tokens)
    consumed: DashMap<String, i64>,
}

impl NonceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a nonce; returns false if it was already consumed and its
    /// retention window has not elapsed.
    pub fn claim(&self, nonce: &str, expires_at: Option<i64>, now: i64) -> bool {
        let retain_until = expires_at.unwrap_or(i64::MAX);
        // Drop entries whose tokens can no longer validate anyway
        self.consumed.retain(|_, until| *until > now);
        // Check-and-claim under one shard lock: concurrent validations of
        // the same nonce race to a single winner
        match self.consumed.entry(nonce.to_string()) {
            Entry::Occupied(mut occupied) => {
                if *occupied.get() > now {
                    return false;
                }
                occupied.insert(retain_until);
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(retain_until);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.consumed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumed.is_empty()
    }
}

/// Issues and validates capability tokens under a process-wide secret
pub struct TokenService {
    secret: Vec<u8>,
    nonces: NonceRegistry,
}

impl fmt::Debug for TokenService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenService([REDACTED])")
    }
}

impl TokenService {
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            nonces: NonceRegistry::new(),
        }
    }

    /// Issue a token; omitted ttl produces a non-expiring token
    /// (used for durable feed-access links).
    pub fn issue(&self, subject: &str, scopes: ScopeSet, ttl: Option<Duration>) -> SignedToken {
        self.issue_at(subject, scopes, ttl, Utc::now().timestamp())
    }

    /// Clock-injected variant of [`issue`](Self::issue)
    pub fn issue_at(
        &self,
        subject: &str,
        scopes: ScopeSet,
        ttl: Option<Duration>,
        issued_at: i64,
    ) -> SignedToken {
        let payload = TokenPayload {
            subject: subject.to_string(),
            scopes,
            issued_at,
            expires_at: ttl.map(|t| issued_at + t.as_secs() as i64),
            nonce: None,
        };
        self.sign(payload)
    }

    /// Issue a CSRF token: subject is the session id, scopes name the
    /// mutating endpoints it may hit, default ttl one week. A nonce-bound
    /// token is accepted at most once.
    pub fn issue_csrf(
        &self,
        session_id: &str,
        scopes: ScopeSet,
        ttl: Option<Duration>,
        single_use: bool,
    ) -> SignedToken {
        let issued_at = Utc::now().timestamp();
        let ttl = ttl.unwrap_or(CSRF_DEFAULT_TTL);
        let payload = TokenPayload {
            subject: session_id.to_string(),
            scopes,
            issued_at,
            expires_at: Some(issued_at + ttl.as_secs() as i64),
            nonce: single_use.then(|| {
                let mut bytes = [0u8; 16];
                rand::rng().fill(&mut bytes);
                URL_SAFE_NO_PAD.encode(bytes)
            }),
        };
        self.sign(payload)
    }

    fn sign(&self, payload: TokenPayload) -> SignedToken {
        let payload_json = serde_json::to_vec(&payload).expect("serialize payload");
        let payload_b64 = URL_SAFE_NO_PAD.encode(&payload_json);

        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(payload_b64.as_bytes());
        let tag_b64 = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        SignedToken {
            token: format!("{}{}.{}", TOKEN_PREFIX, payload_b64, tag_b64),
            payload,
        }
    }

    /// Validate a token against a required scope and return its subject
    pub fn validate(&self, token: &str, required_scope: &str) -> Result<String, TokenError> {
        self.validate_at(token, required_scope, Utc::now().timestamp())
    }

    /// Clock-injected variant of [`validate`](Self::validate)
    pub fn validate_at(
        &self,
        token: &str,
        required_scope: &str,
        now: i64,
    ) -> Result<String, TokenError> {
        let result = self.check(token, required_scope, now);
        if let Err(ref e) = result {
            // Distinct kinds internally; the API layer collapses them
            warn!(kind = %error_kind(e), "token validation failed");
        }
        result
    }

    fn check(&self, token: &str, required_scope: &str, now: i64) -> Result<String, TokenError> {
        let content = token
            .strip_prefix(TOKEN_PREFIX)
            .ok_or(TokenError::InvalidFormat)?;
        let (payload_b64, tag_b64) = content.split_once('.').ok_or(TokenError::InvalidFormat)?;

        // Full-tag comparison comes first, over the transmitted payload bytes
        let tag = URL_SAFE_NO_PAD
            .decode(tag_b64)
            .map_err(|_| TokenError::InvalidSignature)?;
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(payload_b64.as_bytes());
        mac.verify_slice(&tag)
            .map_err(|_| TokenError::InvalidSignature)?;

        let payload_json = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|e| TokenError::DecodeError(e.to_string()))?;
        let payload: TokenPayload = serde_json::from_slice(&payload_json)
            .map_err(|e| TokenError::DecodeError(e.to_string()))?;

        if let Some(expires_at) = payload.expires_at {
            if now >= expires_at {
                return Err(TokenError::Expired);
            }
        }

        if !payload.scopes.authorizes(required_scope) {
            return Err(TokenError::ScopeDenied {
                required: required_scope.to_string(),
            });
        }

        // Consume the nonce last so a failed validation does not burn it
        if let Some(ref nonce) = payload.nonce {
            if !self.nonces.claim(nonce, payload.expires_at, now) {
                return Err(TokenError::NonceReplayed);
            }
        }

        Ok(payload.subject)
    }
}

fn error_kind(e: &TokenError) -> &'static str {
    match e {
        TokenError::InvalidFormat => "invalid_format",
        TokenError::InvalidSignature => "invalid_signature",
        TokenError::Expired => "expired",
        TokenError::ScopeDenied { .. } => "scope_denied",
        TokenError::NonceReplayed => "nonce_replayed",
        TokenError::DecodeError(_) => "decode_error",
    }
}
