use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use std::sync::Arc;

use crate::error::ApiError;
use crate::extract::ApiJson;
use crate::models::{CreateUser, UpdateUser, User};
use crate::state::AppState;

pub async fn list_users(State(state): State<Arc<AppState>>) -> Json<Vec<User>> {
    Json(state.users.list())
}

pub async fn get_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<User>, ApiError> {
    state
        .users
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("User {id} not found")))
}

pub async fn create_user(
    State(state): State<Arc<AppState>>,
    ApiJson(payload): ApiJson<CreateUser>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    let user = state.users.insert(payload.validated()?)?;
    tracing::info!(id = %user.id, "user created");
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn update_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ApiJson(payload): ApiJson<UpdateUser>,
) -> Result<Json<User>, ApiError> {
    let user = state.users.update(&id, payload.validated()?)?;
    Ok(Json(user))
}

pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.users.delete(&id)?;
    tracing::info!(%id, "user deleted");
    Ok(StatusCode::NO_CONTENT)
}
