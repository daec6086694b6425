use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use lanyard_core::{AppState, CoreError};
use lanyard_models::Huddle;
use serde::Deserialize;
use serde_json::Value;

use crate::error::ApiError;
use crate::middleware::AuthUser;

#[derive(Deserialize)]
pub struct CreateHuddleRequest {
    pub channel_id: String,
    pub name: Option<String>,
    #[serde(default)]
    pub settings: Value,
}

#[derive(Deserialize, Default)]
pub struct JoinHuddleRequest {
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Deserialize)]
pub struct MuteRequest {
    pub muted: bool,
}

#[derive(Deserialize)]
pub struct VideoRequest {
    pub video_off: bool,
}

pub async fn create(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<CreateHuddleRequest>,
) -> Result<(StatusCode, Json<Huddle>), ApiError> {
    if req.channel_id.is_empty() {
        return Err(CoreError::BadRequest("channel_id required".into()).into());
    }
    let huddle = state
        .huddles
        .create(auth.user_id, &req.channel_id, req.name, req.settings);
    Ok((StatusCode::CREATED, Json(huddle)))
}

pub async fn join(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(huddle_id): Path<String>,
    body: Option<Json<JoinHuddleRequest>>,
) -> Result<Json<Huddle>, ApiError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    Ok(Json(state.huddles.join(&huddle_id, auth.user_id, req.metadata)?))
}

pub async fn leave(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(huddle_id): Path<String>,
) -> Result<Json<Huddle>, ApiError> {
    Ok(Json(state.huddles.leave(&huddle_id, auth.user_id)?))
}

pub async fn end(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(huddle_id): Path<String>,
) -> Result<Json<Huddle>, ApiError> {
    Ok(Json(state.huddles.end(&huddle_id, auth.user_id)?))
}

pub async fn get_huddle(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(huddle_id): Path<String>,
) -> Result<Json<Huddle>, ApiError> {
    let huddle = state.huddles.get(&huddle_id).ok_or(CoreError::NotFound)?;
    Ok(Json(huddle))
}

pub async fn list_for_channel(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(channel_id): Path<String>,
) -> Json<Vec<Huddle>> {
    Json(state.huddles.list_for_channel(&channel_id))
}

pub async fn mute(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(huddle_id): Path<String>,
    Json(req): Json<MuteRequest>,
) -> Result<StatusCode, ApiError> {
    state.huddles.toggle_mute(&huddle_id, auth.user_id, req.muted)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn video(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(huddle_id): Path<String>,
    Json(req): Json<VideoRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .huddles
        .toggle_video(&huddle_id, auth.user_id, req.video_off)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Escape hatch for clients that lost track of their huddle memberships,
/// e.g. after a crash. Ends huddles this user initiated alone and leaves
/// the rest. Safe to call when the user is in no huddle at all.
pub async fn force_leave(
    State(state): State<AppState>,
    auth: AuthUser,
) -> StatusCode {
    state.huddles.force_leave_all(auth.user_id);
    StatusCode::NO_CONTENT
}
