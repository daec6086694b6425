use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HuddleStatus {
    Active,
    Ended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HuddleParticipant {
    pub user_id: i64,
    pub joined_at: DateTime<Utc>,
    /// None while the participant is present.
    pub left_at: Option<DateTime<Utc>>,
    pub is_muted: bool,
    pub is_video_off: bool,
    pub is_screen_sharing: bool,
    /// Opaque per-participant blob supplied at join time (display hints,
    /// device info, ...). Not interpreted by the manager.
    #[serde(default)]
    pub metadata: Value,
}

impl HuddleParticipant {
    pub fn joined(user_id: i64, metadata: Value) -> Self {
        Self {
            user_id,
            joined_at: Utc::now(),
            left_at: None,
            is_muted: false,
            is_video_off: true,
            is_screen_sharing: false,
            metadata,
        }
    }

    pub fn is_present(&self) -> bool {
        self.left_at.is_none()
    }
}

/// A lightweight multi-party room. No ringing phase: joining is immediate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Huddle {
    pub id: String,
    /// Parent conversation channel this huddle was started in.
    pub channel_id: String,
    pub initiator_id: i64,
    pub name: Option<String>,
    pub status: HuddleStatus,
    /// Opaque client settings blob (background, knock-to-enter, ...). Not
    /// interpreted by the manager.
    #[serde(default)]
    pub settings: Value,
    pub participants: HashMap<i64, HuddleParticipant>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Huddle {
    pub fn active_participants(&self) -> impl Iterator<Item = &HuddleParticipant> {
        self.participants.values().filter(|p| p.is_present())
    }

    pub fn active_count(&self) -> usize {
        self.active_participants().count()
    }

    pub fn is_ended(&self) -> bool {
        self.status == HuddleStatus::Ended
    }
}
