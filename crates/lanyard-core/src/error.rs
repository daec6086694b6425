use lanyard_models::{CallStatus, UnknownValue};
use thiserror::Error;

/// Manager-level failure taxonomy. State violations are structured results
/// so HTTP handlers and channel event handlers can map them 1:1 to
/// client-visible error codes.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not found")]
    NotFound,
    #[error("forbidden")]
    Forbidden,
    #[error("user {user_id} is not a participant")]
    NotParticipant { user_id: i64 },
    #[error("user {user_id} is already in an active call")]
    AlreadyInCall { user_id: i64 },
    #[error("illegal call transition: {from} -> {to}")]
    InvalidTransition { from: CallStatus, to: CallStatus },
    #[error("call is {status}, operation requires a live call")]
    CallNotLive { status: CallStatus },
    #[error("huddle has ended")]
    HuddleEnded,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    UnknownValue(#[from] UnknownValue),
}

impl CoreError {
    /// Stable machine-readable code used in error replies and REST bodies.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::NotFound => "not_found",
            CoreError::Forbidden => "forbidden",
            CoreError::NotParticipant { .. } => "not_participant",
            CoreError::AlreadyInCall { .. } => "already_in_call",
            CoreError::InvalidTransition { .. } => "invalid_transition",
            CoreError::CallNotLive { .. } => "call_not_live",
            CoreError::HuddleEnded => "huddle_ended",
            CoreError::BadRequest(_) => "bad_request",
            CoreError::UnknownValue(_) => "unknown_value",
        }
    }
}
