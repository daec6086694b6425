use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::signal::IceServer;
use crate::UnknownValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Audio,
    Video,
    GroupAudio,
    GroupVideo,
}

impl CallType {
    pub fn is_group(&self) -> bool {
        matches!(self, CallType::GroupAudio | CallType::GroupVideo)
    }
}

impl FromStr for CallType {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(CallType::Audio),
            "video" => Ok(CallType::Video),
            "group_audio" => Ok(CallType::GroupAudio),
            "group_video" => Ok(CallType::GroupVideo),
            other => Err(UnknownValue::new("call type", other)),
        }
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallType::Audio => "audio",
            CallType::Video => "video",
            CallType::GroupAudio => "group_audio",
            CallType::GroupVideo => "group_video",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Initiating,
    Ringing,
    Connecting,
    Active,
    Ended,
    Failed,
    Missed,
    Declined,
    Busy,
}

impl CallStatus {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Ended
                | CallStatus::Failed
                | CallStatus::Missed
                | CallStatus::Declined
                | CallStatus::Busy
        )
    }

    /// Whether signaling may still be relayed for a call in this state.
    pub fn accepts_signals(&self) -> bool {
        matches!(
            self,
            CallStatus::Initiating | CallStatus::Ringing | CallStatus::Connecting | CallStatus::Active
        )
    }

    /// The legal transition table. Anything not listed here is rejected and
    /// leaves the call untouched.
    pub fn can_transition_to(&self, next: CallStatus) -> bool {
        use CallStatus::*;
        matches!(
            (self, next),
            (Initiating, Ringing)
                | (Initiating, Failed)
                | (Ringing, Connecting)
                | (Ringing, Active)
                | (Ringing, Ended)
                | (Ringing, Missed)
                | (Ringing, Declined)
                | (Ringing, Busy)
                | (Connecting, Active)
                | (Connecting, Ended)
                | (Connecting, Failed)
                | (Connecting, Declined)
                | (Active, Ended)
                | (Active, Failed)
        )
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallStatus::Initiating => "initiating",
            CallStatus::Ringing => "ringing",
            CallStatus::Connecting => "connecting",
            CallStatus::Active => "active",
            CallStatus::Ended => "ended",
            CallStatus::Failed => "failed",
            CallStatus::Missed => "missed",
            CallStatus::Declined => "declined",
            CallStatus::Busy => "busy",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Ringing,
    Connected,
    Declined,
    Missed,
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Completed,
    Cancelled,
    NoAnswer,
    Declined,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallParticipant {
    pub user_id: i64,
    pub status: ParticipantStatus,
    pub joined_at: Option<DateTime<Utc>>,
    pub left_at: Option<DateTime<Utc>>,
    pub is_muted: bool,
    pub is_video_off: bool,
    pub is_screen_sharing: bool,
}

impl CallParticipant {
    pub fn ringing(user_id: i64) -> Self {
        Self {
            user_id,
            status: ParticipantStatus::Ringing,
            joined_at: None,
            left_at: None,
            is_muted: false,
            is_video_off: false,
            is_screen_sharing: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ParticipantStatus::Connected
    }
}

/// A call session. Owned exclusively by the call manager; clients only ever
/// see snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub id: String,
    pub initiator_id: i64,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub status: CallStatus,
    pub participants: Vec<CallParticipant>,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
    /// Seconds of active talk time. Zero for calls that never became active.
    pub duration_seconds: i64,
    pub ice_servers: Vec<IceServer>,
}

impl Call {
    pub fn participant(&self, user_id: i64) -> Option<&CallParticipant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn participant_mut(&mut self, user_id: i64) -> Option<&mut CallParticipant> {
        self.participants.iter_mut().find(|p| p.user_id == user_id)
    }

    pub fn is_participant(&self, user_id: i64) -> bool {
        self.participant(user_id).is_some()
    }

    /// Participants who have neither left nor terminally refused the call.
    pub fn remaining_participants(&self) -> usize {
        self.participants
            .iter()
            .filter(|p| {
                matches!(
                    p.status,
                    ParticipantStatus::Ringing | ParticipantStatus::Connected
                )
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_type_parse_is_total() {
        assert_eq!("group_video".parse::<CallType>().unwrap(), CallType::GroupVideo);
        let err = "screen".parse::<CallType>().unwrap_err();
        assert_eq!(err.value, "screen");
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for status in [
            CallStatus::Ended,
            CallStatus::Failed,
            CallStatus::Missed,
            CallStatus::Declined,
            CallStatus::Busy,
        ] {
            assert!(status.is_terminal());
            for next in [CallStatus::Ringing, CallStatus::Active, CallStatus::Ended] {
                assert!(!status.can_transition_to(next));
            }
        }
    }

    #[test]
    fn ringing_to_active_is_legal_but_not_reverse() {
        assert!(CallStatus::Ringing.can_transition_to(CallStatus::Active));
        assert!(!CallStatus::Active.can_transition_to(CallStatus::Ringing));
    }

    #[test]
    fn call_type_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(CallType::GroupAudio).unwrap(),
            serde_json::json!("group_audio")
        );
    }
}
