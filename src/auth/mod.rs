//! Authentication and authorization
//!
//! Capability tokens are HMAC-signed, self-contained, and carry the scopes
//! they authorize. The CSRF variant binds a token to a session id and a
//! small list of mutating endpoint names.

mod scopes;
mod tokens;

pub use scopes::{ScopeSet, WILDCARD_SCOPE};
pub use tokens::{
    NonceRegistry, SignedToken, TokenError, TokenPayload, TokenService, CSRF_DEFAULT_TTL,
    TOKEN_PREFIX,
};
