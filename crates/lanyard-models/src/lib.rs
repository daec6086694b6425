pub mod call;
pub mod frame;
pub mod huddle;
pub mod signal;
pub mod topic;

pub use call::{Call, CallParticipant, CallStatus, CallType, EndReason, ParticipantStatus};
pub use frame::{Frame, Reply, ReplyStatus};
pub use huddle::{Huddle, HuddleParticipant, HuddleStatus};
pub use signal::{IceServer, Signal, SignalKind};
pub use topic::Topic;

use thiserror::Error;

/// Returned by every string-to-enum parse in this crate. Inbound values are
/// untrusted, so an unknown string is a typed error, never a panic.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownValue {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownValue {
    pub fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}
