use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use lanyard_core::CoreError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("{0}")]
    Core(#[from] CoreError),
    #[error("internal server error")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, "unauthorized", self.to_string())
            }
            ApiError::Core(e) => (core_status(e), e.code(), e.to_string()),
            ApiError::Internal(err) => {
                tracing::error!("API internal error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": code, "message": message }))).into_response()
    }
}

/// 1:1 mapping from the manager failure taxonomy. State violations are
/// conflicts, authorization failures are 403s.
fn core_status(e: &CoreError) -> StatusCode {
    match e {
        CoreError::NotFound => StatusCode::NOT_FOUND,
        CoreError::Forbidden | CoreError::NotParticipant { .. } => StatusCode::FORBIDDEN,
        CoreError::AlreadyInCall { .. }
        | CoreError::InvalidTransition { .. }
        | CoreError::CallNotLive { .. }
        | CoreError::HuddleEnded => StatusCode::CONFLICT,
        CoreError::BadRequest(_) | CoreError::UnknownValue(_) => StatusCode::BAD_REQUEST,
    }
}
