use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use lanyard_core::{AppState, CoreError};
use lanyard_models::{Call, CallType};
use serde::Deserialize;

use crate::error::ApiError;
use crate::middleware::AuthUser;

#[derive(Deserialize)]
pub struct InitiateCallRequest {
    pub callee_ids: Vec<i64>,
    #[serde(rename = "type")]
    pub call_type: String,
}

#[derive(Deserialize)]
pub struct AnswerCallRequest {
    pub sdp: serde_json::Value,
}

#[derive(Deserialize)]
pub struct RejectCallRequest {
    pub reason: Option<String>,
}

#[derive(Deserialize)]
pub struct HistoryParams {
    pub limit: Option<usize>,
}

const HISTORY_DEFAULT_LIMIT: usize = 50;

pub async fn initiate(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<InitiateCallRequest>,
) -> Result<(StatusCode, Json<Call>), ApiError> {
    let call_type: CallType = req
        .call_type
        .parse()
        .map_err(CoreError::UnknownValue)?;
    let ice_servers = state.ice.ice_servers(auth.user_id);
    let call = state
        .calls
        .initiate(auth.user_id, &req.callee_ids, call_type, ice_servers)?;
    Ok((StatusCode::CREATED, Json(call)))
}

pub async fn answer(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(call_id): Path<String>,
    Json(req): Json<AnswerCallRequest>,
) -> Result<Json<Call>, ApiError> {
    let call = state.calls.answer(&call_id, auth.user_id, req.sdp)?;
    Ok(Json(call))
}

pub async fn reject(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(call_id): Path<String>,
    Json(req): Json<RejectCallRequest>,
) -> Result<Json<Call>, ApiError> {
    let call = state
        .calls
        .reject(&call_id, auth.user_id, req.reason.as_deref())?;
    Ok(Json(call))
}

pub async fn end(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(call_id): Path<String>,
) -> Result<Json<Call>, ApiError> {
    let call = state.calls.end(&call_id, auth.user_id)?;
    Ok(Json(call))
}

/// Call records are visible to their participants only.
pub async fn get_call(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(call_id): Path<String>,
) -> Result<Json<Call>, ApiError> {
    let call = state.calls.get(&call_id).ok_or(CoreError::NotFound)?;
    if !call.is_participant(auth.user_id) {
        return Err(CoreError::Forbidden.into());
    }
    Ok(Json(call))
}

pub async fn active(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Json<Option<Call>> {
    Json(state.calls.active_call(auth.user_id))
}

pub async fn history(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(params): Query<HistoryParams>,
) -> Json<Vec<Call>> {
    let limit = params.limit.unwrap_or(HISTORY_DEFAULT_LIMIT);
    Json(state.calls.history(auth.user_id, limit))
}
