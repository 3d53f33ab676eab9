use axum::{Json, response::IntoResponse};

// health handler, sits behind the rate limiter like every other route
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}
