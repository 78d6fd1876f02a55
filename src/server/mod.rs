//! HTTP server: webhook callbacks and streaming subscriptions

mod routes;
mod stream;

pub use routes::{build_router, ApiError, AppState, NOTIFICATIONS_SCOPE};
pub use stream::subscribe;
