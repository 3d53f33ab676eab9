//! Router and middleware pipeline.
//!
//! Outermost first: request tracing, rate limiting, CORS, panic capture,
//! then the routes. A 429 short-circuits before CORS runs.

use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware,
    routing::get,
};
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::{not_found, panic_response};
use crate::handlers;
use crate::rate_limit::rate_limit_middleware;
use crate::state::AppState;

pub fn cors_layer(origin: HeaderValue) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
}

pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .route(
            "/api/users",
            get(handlers::list_users).post(handlers::create_user),
        )
        .route(
            "/api/users/{id}",
            get(handlers::get_user)
                .put(handlers::update_user)
                .delete(handlers::delete_user),
        )
}

// Wraps `routes` in the full middleware stack and the JSON 404 fallback
pub fn with_pipeline(
    routes: Router<Arc<AppState>>,
    state: Arc<AppState>,
    cors_origin: HeaderValue,
) -> Router {
    routes
        .fallback(not_found)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(cors_layer(cors_origin))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub fn create_router(state: Arc<AppState>, cors_origin: HeaderValue) -> Router {
    with_pipeline(api_routes(), state, cors_origin)
}
