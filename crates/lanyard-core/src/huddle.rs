use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use lanyard_models::{frame, Huddle, HuddleParticipant, HuddleStatus, Topic};
use serde_json::{json, Value};

use crate::call::ParticipantFlag;
use crate::error::CoreError;
use crate::relay::SignalRelay;

/// Server-side authority for huddles: lightweight multi-party rooms with no
/// ringing phase. Mutation is serialized per huddle id by the dashmap entry
/// lock, same as the call manager.
pub struct HuddleManager {
    relay: Arc<dyn SignalRelay>,
    huddles: DashMap<String, Huddle>,
}

impl HuddleManager {
    pub fn new(relay: Arc<dyn SignalRelay>) -> Self {
        Self {
            relay,
            huddles: DashMap::new(),
        }
    }

    /// Start a huddle with the initiator as sole participant.
    pub fn create(
        &self,
        initiator_id: i64,
        channel_id: &str,
        name: Option<String>,
        settings: Value,
    ) -> Huddle {
        let id = uuid::Uuid::new_v4().to_string();
        let mut huddle = Huddle {
            id: id.clone(),
            channel_id: channel_id.to_string(),
            initiator_id,
            name,
            status: HuddleStatus::Active,
            settings,
            participants: Default::default(),
            created_at: Utc::now(),
            ended_at: None,
        };
        huddle
            .participants
            .insert(initiator_id, HuddleParticipant::joined(initiator_id, Value::Null));
        self.huddles.insert(id.clone(), huddle.clone());
        tracing::info!(huddle_id = %id, initiator_id, channel_id, "huddle created");
        huddle
    }

    /// Join (or rejoin after a transient leave). Joining an ended huddle
    /// fails; there is no resurrection. The metadata blob travels with the
    /// participant record and is replaced wholesale on rejoin.
    pub fn join(
        &self,
        huddle_id: &str,
        user_id: i64,
        metadata: Value,
    ) -> Result<Huddle, CoreError> {
        let (snapshot, participant) = {
            let mut huddle = self.get_mut(huddle_id)?;
            if huddle.is_ended() {
                return Err(CoreError::HuddleEnded);
            }
            let participant = huddle
                .participants
                .entry(user_id)
                .and_modify(|p| {
                    // Rejoin: clear the transient leave.
                    p.left_at = None;
                    p.metadata = metadata.clone();
                })
                .or_insert_with(|| HuddleParticipant::joined(user_id, metadata.clone()))
                .clone();
            (huddle.clone(), participant)
        };

        self.relay.publish(
            &Topic::huddle(huddle_id).to_string(),
            frame::EVENT_PARTICIPANT_JOINED,
            json!({ "participant": participant }),
        );
        Ok(snapshot)
    }

    /// Leave a huddle. The last active participant leaving ends it.
    pub fn leave(&self, huddle_id: &str, user_id: i64) -> Result<Huddle, CoreError> {
        let (snapshot, ended_now) = {
            let mut huddle = self.get_mut(huddle_id)?;
            match huddle.participants.get_mut(&user_id) {
                Some(p) if p.is_present() => p.left_at = Some(Utc::now()),
                Some(_) => return Ok(huddle.clone()),
                None => return Err(CoreError::NotParticipant { user_id }),
            }
            let ended_now = huddle.active_count() == 0 && !huddle.is_ended();
            if ended_now {
                huddle.status = HuddleStatus::Ended;
                huddle.ended_at = Some(Utc::now());
            }
            (huddle.clone(), ended_now)
        };

        let topic = Topic::huddle(huddle_id).to_string();
        self.relay.publish(
            &topic,
            frame::EVENT_PARTICIPANT_LEFT,
            json!({ "user_id": user_id }),
        );
        if ended_now {
            tracing::info!(huddle_id, "huddle ended (last participant left)");
            self.relay
                .publish(&topic, frame::EVENT_HUDDLE_ENDED, json!({ "huddle_id": huddle_id }));
        }
        Ok(snapshot)
    }

    pub fn toggle_mute(
        &self,
        huddle_id: &str,
        user_id: i64,
        muted: bool,
    ) -> Result<(), CoreError> {
        self.update_flag(huddle_id, user_id, ParticipantFlag::Muted, muted)
    }

    pub fn toggle_video(
        &self,
        huddle_id: &str,
        user_id: i64,
        video_off: bool,
    ) -> Result<(), CoreError> {
        self.update_flag(huddle_id, user_id, ParticipantFlag::VideoOff, video_off)
    }

    /// Idempotent flag update; broadcasts a diff carrying only the changed
    /// field, never the full participant.
    fn update_flag(
        &self,
        huddle_id: &str,
        user_id: i64,
        field: ParticipantFlag,
        value: bool,
    ) -> Result<(), CoreError> {
        let changed = {
            let mut huddle = self.get_mut(huddle_id)?;
            if huddle.is_ended() {
                return Err(CoreError::HuddleEnded);
            }
            let p = huddle
                .participants
                .get_mut(&user_id)
                .filter(|p| p.is_present())
                .ok_or(CoreError::NotParticipant { user_id })?;
            let slot = match field {
                ParticipantFlag::Muted => &mut p.is_muted,
                ParticipantFlag::VideoOff => &mut p.is_video_off,
                ParticipantFlag::ScreenSharing => &mut p.is_screen_sharing,
            };
            let changed = *slot != value;
            *slot = value;
            changed
        };

        if changed {
            self.relay.publish(
                &Topic::huddle(huddle_id).to_string(),
                frame::EVENT_PARTICIPANT_UPDATED,
                json!({ "user_id": user_id, (field.key()): value }),
            );
        }
        Ok(())
    }

    /// Explicit termination by the initiator. Subsequent joins fail.
    pub fn end(&self, huddle_id: &str, caller_id: i64) -> Result<Huddle, CoreError> {
        let snapshot = {
            let mut huddle = self.get_mut(huddle_id)?;
            if huddle.is_ended() {
                return Ok(huddle.clone());
            }
            if huddle.initiator_id != caller_id {
                return Err(CoreError::Forbidden);
            }
            self.end_in_place(&mut huddle);
            huddle.clone()
        };

        tracing::info!(huddle_id, caller_id, "huddle ended");
        self.relay.publish(
            &Topic::huddle(huddle_id).to_string(),
            frame::EVENT_HUDDLE_ENDED,
            json!({ "huddle_id": huddle_id }),
        );
        Ok(snapshot)
    }

    /// Administrative cleanup after a client vanished without a clean leave:
    /// ends every huddle the user initiated and marks them left everywhere
    /// else. Safe to call redundantly.
    pub fn force_leave_all(&self, user_id: i64) {
        let ids: Vec<String> = self.huddles.iter().map(|h| h.key().clone()).collect();
        for id in ids {
            let ended_now = {
                let Some(mut huddle) = self.huddles.get_mut(&id) else {
                    continue;
                };
                if huddle.is_ended() {
                    continue;
                }
                if huddle.initiator_id == user_id {
                    self.end_in_place(&mut huddle);
                    true
                } else {
                    match huddle.participants.get_mut(&user_id) {
                        Some(p) if p.is_present() => {
                            p.left_at = Some(Utc::now());
                            if huddle.active_count() == 0 {
                                huddle.status = HuddleStatus::Ended;
                                huddle.ended_at = Some(Utc::now());
                                true
                            } else {
                                false
                            }
                        }
                        _ => continue,
                    }
                }
            };

            let topic = Topic::huddle(&id).to_string();
            self.relay.publish(
                &topic,
                frame::EVENT_PARTICIPANT_LEFT,
                json!({ "user_id": user_id }),
            );
            if ended_now {
                tracing::info!(huddle_id = %id, user_id, "huddle ended by forced cleanup");
                self.relay
                    .publish(&topic, frame::EVENT_HUDDLE_ENDED, json!({ "huddle_id": id }));
            }
        }
    }

    pub fn get(&self, huddle_id: &str) -> Option<Huddle> {
        self.huddles.get(huddle_id).map(|h| h.clone())
    }

    /// Active huddles for a parent conversation channel.
    pub fn list_for_channel(&self, channel_id: &str) -> Vec<Huddle> {
        self.huddles
            .iter()
            .filter(|h| h.channel_id == channel_id && !h.is_ended())
            .map(|h| h.clone())
            .collect()
    }

    fn get_mut(
        &self,
        huddle_id: &str,
    ) -> Result<dashmap::mapref::one::RefMut<'_, String, Huddle>, CoreError> {
        self.huddles.get_mut(huddle_id).ok_or(CoreError::NotFound)
    }

    fn end_in_place(&self, huddle: &mut Huddle) {
        let now = Utc::now();
        huddle.status = HuddleStatus::Ended;
        huddle.ended_at = Some(now);
        for p in huddle.participants.values_mut() {
            if p.is_present() {
                p.left_at = Some(now);
            }
        }
    }
}
