use serde::{Deserialize, Serialize};
use serde_json::Value;

// Reserved protocol events. Everything else is an application event routed
// through the channel's handler table.
pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_HEARTBEAT: &str = "heartbeat";

// Call fan-out events.
pub const EVENT_INCOMING_CALL: &str = "incoming_call";
pub const EVENT_CALL_ANSWERED: &str = "call_answered";
pub const EVENT_CALL_REJECTED: &str = "call_rejected";
pub const EVENT_CALL_ENDED: &str = "call_ended";
pub const EVENT_SIGNAL: &str = "signal";

// Huddle fan-out events.
pub const EVENT_PARTICIPANT_JOINED: &str = "participant_joined";
pub const EVENT_PARTICIPANT_LEFT: &str = "participant_left";
pub const EVENT_PARTICIPANT_UPDATED: &str = "participant_updated";
pub const EVENT_HUDDLE_ENDED: &str = "huddle_ended";

/// One wire message, in either direction. JSON object per message:
/// `{"topic": ..., "event": ..., "payload": ..., "ref": ..., "join_ref": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref")]
    pub frame_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl Frame {
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            frame_ref: None,
            join_ref: None,
        }
    }

    pub fn with_ref(mut self, frame_ref: impl Into<String>) -> Self {
        self.frame_ref = Some(frame_ref.into());
        self
    }

    pub fn with_join_ref(mut self, join_ref: impl Into<String>) -> Self {
        self.join_ref = Some(join_ref.into());
        self
    }

    /// Build the reply frame for an inbound request frame.
    pub fn reply_to(request: &Frame, reply: &Reply) -> Self {
        Self {
            topic: request.topic.clone(),
            event: EVENT_REPLY.to_string(),
            payload: serde_json::to_value(reply).unwrap_or(Value::Null),
            frame_ref: request.frame_ref.clone(),
            join_ref: request.join_ref.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Ok,
    Error,
    Timeout,
}

/// Payload of a `phx_reply` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub status: ReplyStatus,
    #[serde(default)]
    pub response: Value,
}

impl Reply {
    pub fn ok(response: Value) -> Self {
        Self {
            status: ReplyStatus::Ok,
            response,
        }
    }

    pub fn error(response: Value) -> Self {
        Self {
            status: ReplyStatus::Error,
            response,
        }
    }

    /// Synthetic reply used when no real reply arrived in time, or when the
    /// owning channel was torn down with the correlation still pending.
    pub fn timeout() -> Self {
        Self {
            status: ReplyStatus::Timeout,
            response: Value::Null,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }
}
