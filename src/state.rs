use axum::http::HeaderName;
use std::sync::Arc;

use crate::rate_limit::SlidingWindowLimiter;
use crate::store::UserRepository;

// app's shared state, built once at startup and injected into the router
pub struct AppState {
    pub limiter: Arc<SlidingWindowLimiter>, // request log shared by every request
    pub users: Arc<dyn UserRepository>,
    pub trusted_client_header: Option<HeaderName>, // proxy header trusted for the client address
}
