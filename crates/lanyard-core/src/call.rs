use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::DashMap;
use lanyard_models::{
    frame, Call, CallParticipant, CallStatus, CallType, EndReason, IceServer, ParticipantStatus,
    Signal, SignalKind, Topic,
};
use serde_json::{json, Value};

use crate::error::CoreError;
use crate::relay::{SignalRelay, BUFFER_TTL};

/// How many ended calls are retained in memory for the history endpoint.
const HISTORY_CAPACITY: usize = 256;

/// Server-side authority for call state. All mutation goes through manager
/// methods that enforce the transition table; the dashmap entry lock makes
/// each call id single-writer.
pub struct CallSessionManager {
    relay: Arc<dyn SignalRelay>,
    calls: DashMap<String, Call>,
    /// One active call per participant. Reservations live here from
    /// initiate/answer until the call reaches a terminal state.
    active_by_user: DashMap<i64, String>,
    history: Mutex<VecDeque<Call>>,
}

impl CallSessionManager {
    pub fn new(relay: Arc<dyn SignalRelay>) -> Self {
        Self {
            relay,
            calls: DashMap::new(),
            active_by_user: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Create a call, advance it to ringing and notify every callee.
    pub fn initiate(
        &self,
        initiator_id: i64,
        callee_ids: &[i64],
        call_type: CallType,
        ice_servers: Vec<IceServer>,
    ) -> Result<Call, CoreError> {
        if callee_ids.is_empty() {
            return Err(CoreError::BadRequest("at least one callee required".into()));
        }
        if callee_ids.contains(&initiator_id) {
            return Err(CoreError::BadRequest("cannot call yourself".into()));
        }
        if !call_type.is_group() && callee_ids.len() > 1 {
            return Err(CoreError::BadRequest(
                "1:1 call type with multiple callees".into(),
            ));
        }

        let id = uuid::Uuid::new_v4().to_string();
        // Reserve the initiator's one-active-call slot before the call
        // becomes visible anywhere.
        {
            let entry = self.active_by_user.entry(initiator_id).or_insert_with(|| id.clone());
            if *entry != id {
                return Err(CoreError::AlreadyInCall {
                    user_id: initiator_id,
                });
            }
        }

        let now = Utc::now();
        let mut participants = vec![CallParticipant {
            user_id: initiator_id,
            status: ParticipantStatus::Connected,
            joined_at: Some(now),
            left_at: None,
            is_muted: false,
            is_video_off: false,
            is_screen_sharing: false,
        }];
        participants.extend(callee_ids.iter().map(|&id| CallParticipant::ringing(id)));

        let mut call = Call {
            id: id.clone(),
            initiator_id,
            call_type,
            status: CallStatus::Initiating,
            participants,
            started_at: now,
            answered_at: None,
            ended_at: None,
            end_reason: None,
            duration_seconds: 0,
            ice_servers,
        };
        if let Err(e) = Self::transition(&mut call, CallStatus::Ringing) {
            self.release_user(initiator_id, &id);
            return Err(e);
        }
        self.calls.insert(id.clone(), call.clone());

        tracing::info!(call_id = %id, initiator_id, %call_type, callees = callee_ids.len(), "call initiated");
        let topic = Topic::call(&id).to_string();
        let payload = json!({ "call": call });
        for &callee in callee_ids {
            self.relay
                .publish_to_user(callee, &topic, frame::EVENT_INCOMING_CALL, payload.clone());
        }
        Ok(call)
    }

    /// A ringing callee picks up. The SDP answer is relayed to the initiator.
    pub fn answer(
        &self,
        call_id: &str,
        user_id: i64,
        sdp_answer: Value,
    ) -> Result<Call, CoreError> {
        // Reserve the answering user's slot first; answering two concurrent
        // calls must not both succeed. Only a reservation created by this
        // attempt is released on failure.
        let newly_reserved = match self.active_by_user.entry(user_id) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                if entry.get() != call_id {
                    return Err(CoreError::AlreadyInCall { user_id });
                }
                false
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(call_id.to_string());
                true
            }
        };
        let release = |err: CoreError| {
            if newly_reserved {
                self.release_user(user_id, call_id);
            }
            err
        };

        let snapshot = {
            let mut call = self.get_mut(call_id).map_err(release)?;
            if !call.status.can_transition_to(CallStatus::Active) {
                return Err(release(CoreError::InvalidTransition {
                    from: call.status,
                    to: CallStatus::Active,
                }));
            }
            let now = Utc::now();
            match call.participant_mut(user_id) {
                Some(p) if p.status == ParticipantStatus::Ringing => {
                    p.status = ParticipantStatus::Connected;
                    p.joined_at = Some(now);
                }
                Some(_) | None => {
                    return Err(release(CoreError::NotParticipant { user_id }));
                }
            }
            // The connecting phase collapses here: with an SDP answer in
            // hand the call is considered active for accounting purposes.
            call.status = CallStatus::Active;
            if call.answered_at.is_none() {
                call.answered_at = Some(now);
            }
            call.clone()
        };

        tracing::info!(call_id, user_id, "call answered");
        let topic = Topic::call(call_id).to_string();
        self.relay.publish_to_user(
            snapshot.initiator_id,
            &topic,
            frame::EVENT_CALL_ANSWERED,
            json!({ "call_id": call_id, "user_id": user_id, "sdp": sdp_answer }),
        );
        Ok(snapshot)
    }

    /// A ringing callee declines. For 1:1 calls this ends the whole call,
    /// terminally `missed` / `busy` / `declined` depending on the reason.
    pub fn reject(
        &self,
        call_id: &str,
        user_id: i64,
        reason: Option<&str>,
    ) -> Result<Call, CoreError> {
        let missed = matches!(reason, Some("timeout") | Some("no_answer"));
        let busy = matches!(reason, Some("busy"));
        let (snapshot, ended) = {
            let mut call = self.get_mut(call_id)?;
            if call.status.is_terminal() {
                return Err(CoreError::CallNotLive {
                    status: call.status,
                });
            }
            match call.participant_mut(user_id) {
                Some(p) if p.status == ParticipantStatus::Ringing => {
                    p.status = if missed {
                        ParticipantStatus::Missed
                    } else {
                        ParticipantStatus::Declined
                    };
                }
                Some(_) | None => return Err(CoreError::NotParticipant { user_id }),
            }

            let mut ended = false;
            if !call.call_type.is_group() {
                let terminal = if missed {
                    CallStatus::Missed
                } else if busy {
                    CallStatus::Busy
                } else {
                    CallStatus::Declined
                };
                Self::transition(&mut *call, terminal)?;
                call.ended_at = Some(Utc::now());
                call.end_reason = Some(if missed {
                    EndReason::NoAnswer
                } else {
                    EndReason::Declined
                });
                ended = true;
            } else if call.participants.iter().all(|p| {
                p.user_id == call.initiator_id
                    || !matches!(
                        p.status,
                        ParticipantStatus::Ringing | ParticipantStatus::Connected
                    )
            }) && call.status.can_transition_to(CallStatus::Declined)
            {
                // Every callee refused a group call.
                Self::transition(&mut *call, CallStatus::Declined)?;
                call.ended_at = Some(Utc::now());
                call.end_reason = Some(EndReason::Declined);
                ended = true;
            }
            (call.clone(), ended)
        };

        if ended {
            self.retire(&snapshot);
        }
        tracing::info!(call_id, user_id, missed, "call rejected");
        let topic = Topic::call(call_id).to_string();
        self.relay.publish_to_user(
            snapshot.initiator_id,
            &topic,
            frame::EVENT_CALL_REJECTED,
            json!({ "call_id": call_id, "user_id": user_id, "reason": reason }),
        );
        Ok(snapshot)
    }

    /// Pure relay of an offer/answer/ICE signal between two participants of
    /// a live call. Only the envelope is validated; the payload is opaque.
    pub fn relay_signal(
        &self,
        call_id: &str,
        from_user_id: i64,
        to_user_id: i64,
        kind: SignalKind,
        payload: Value,
    ) -> Result<(), CoreError> {
        {
            let call = self.calls.get(call_id).ok_or(CoreError::NotFound)?;
            if !call.status.accepts_signals() {
                return Err(CoreError::CallNotLive {
                    status: call.status,
                });
            }
            if !call.is_participant(from_user_id) {
                return Err(CoreError::NotParticipant {
                    user_id: from_user_id,
                });
            }
            if !call.is_participant(to_user_id) {
                return Err(CoreError::NotParticipant {
                    user_id: to_user_id,
                });
            }
        }

        let now = Utc::now();
        let signal = Signal {
            kind,
            from: from_user_id,
            to: to_user_id,
            payload,
            created_at: now,
            expires_at: now + chrono::Duration::from_std(BUFFER_TTL).unwrap_or_default(),
        };
        let topic = Topic::call(call_id).to_string();
        self.relay.publish_to_user(
            to_user_id,
            &topic,
            frame::EVENT_SIGNAL,
            serde_json::to_value(&signal).unwrap_or(Value::Null),
        );
        Ok(())
    }

    /// A participant of a group call hangs up without ending the call for
    /// everyone. When the last party leaves, the call auto-ends.
    pub fn leave(&self, call_id: &str, user_id: i64) -> Result<Call, CoreError> {
        let (snapshot, ended) = {
            let mut call = self.get_mut(call_id)?;
            if call.status.is_terminal() {
                return Ok(call.clone());
            }
            let now = Utc::now();
            match call.participant_mut(user_id) {
                Some(p) if p.status != ParticipantStatus::Left => {
                    p.status = ParticipantStatus::Left;
                    p.left_at = Some(now);
                }
                Some(_) => return Ok(call.clone()),
                None => return Err(CoreError::NotParticipant { user_id }),
            }

            let mut ended = false;
            if call.remaining_participants() == 0 {
                // All parties hung up; this is a completed call.
                Self::transition(&mut *call, CallStatus::Ended)?;
                call.ended_at = Some(now);
                call.end_reason = Some(EndReason::Completed);
                call.duration_seconds = call
                    .answered_at
                    .map(|a| (now - a).num_seconds().max(0))
                    .unwrap_or(0);
                ended = true;
            }
            (call.clone(), ended)
        };

        self.release_user(user_id, call_id);
        if ended {
            self.retire(&snapshot);
            self.broadcast_ended(&snapshot);
        } else {
            let topic = Topic::call(call_id).to_string();
            self.relay.publish(
                &topic,
                frame::EVENT_PARTICIPANT_LEFT,
                json!({ "user_id": user_id }),
            );
        }
        Ok(snapshot)
    }

    /// End a call for everyone. Idempotent: ending an already-ended call
    /// returns the existing terminal record.
    pub fn end(&self, call_id: &str, ender_id: i64) -> Result<Call, CoreError> {
        let snapshot = {
            let mut call = self.get_mut(call_id)?;
            if call.status.is_terminal() {
                return Ok(call.clone());
            }
            if !call.is_participant(ender_id) {
                return Err(CoreError::NotParticipant { user_id: ender_id });
            }

            let now = Utc::now();
            let reason = match call.status {
                CallStatus::Active => EndReason::Completed,
                CallStatus::Ringing | CallStatus::Connecting => {
                    if ender_id == call.initiator_id {
                        EndReason::Cancelled
                    } else {
                        EndReason::NoAnswer
                    }
                }
                _ => EndReason::Failed,
            };
            Self::transition(&mut *call, CallStatus::Ended)?;
            call.end_reason = Some(reason);
            call.ended_at = Some(now);
            call.duration_seconds = call
                .answered_at
                .map(|a| (now - a).num_seconds().max(0))
                .unwrap_or(0);
            for p in &mut call.participants {
                if p.is_active() {
                    p.status = ParticipantStatus::Left;
                    p.left_at = Some(now);
                }
            }
            call.clone()
        };

        tracing::info!(call_id, ender_id, reason = ?snapshot.end_reason, duration = snapshot.duration_seconds, "call ended");
        self.retire(&snapshot);
        self.broadcast_ended(&snapshot);
        Ok(snapshot)
    }

    /// Idempotent toggle of a participant's mute/video/screen-share flags.
    /// Broadcasts only the changed field to keep fan-out payloads small.
    pub fn update_participant_flag(
        &self,
        call_id: &str,
        user_id: i64,
        field: ParticipantFlag,
        value: bool,
    ) -> Result<(), CoreError> {
        let changed = {
            let mut call = self.get_mut(call_id)?;
            if call.status.is_terminal() {
                return Err(CoreError::CallNotLive {
                    status: call.status,
                });
            }
            let p = call
                .participant_mut(user_id)
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
            let topic = Topic::call(call_id).to_string();
            self.relay.publish(
                &topic,
                frame::EVENT_PARTICIPANT_UPDATED,
                json!({ "user_id": user_id, (field.key()): value }),
            );
        }
        Ok(())
    }

    pub fn get(&self, call_id: &str) -> Option<Call> {
        self.calls.get(call_id).map(|c| c.clone())
    }

    /// The call a user is currently reserved into, if any.
    pub fn active_call(&self, user_id: i64) -> Option<Call> {
        let call_id = self.active_by_user.get(&user_id)?.clone();
        self.get(&call_id)
    }

    /// Most recent ended calls involving the user, newest first.
    pub fn history(&self, user_id: i64, limit: usize) -> Vec<Call> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history
            .iter()
            .rev()
            .filter(|c| c.is_participant(user_id))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Every status change funnels through here so the model's transition
    /// table stays the single authority on legality.
    fn transition(call: &mut Call, to: CallStatus) -> Result<(), CoreError> {
        if !call.status.can_transition_to(to) {
            return Err(CoreError::InvalidTransition {
                from: call.status,
                to,
            });
        }
        call.status = to;
        Ok(())
    }

    fn get_mut(
        &self,
        call_id: &str,
    ) -> Result<dashmap::mapref::one::RefMut<'_, String, Call>, CoreError> {
        self.calls.get_mut(call_id).ok_or(CoreError::NotFound)
    }

    fn release_user(&self, user_id: i64, call_id: &str) {
        self.active_by_user
            .remove_if(&user_id, |_, active| active == call_id);
    }

    /// Move a terminal call out of the active index and into history.
    fn retire(&self, call: &Call) {
        for p in &call.participants {
            self.release_user(p.user_id, &call.id);
        }
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        if history.len() >= HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(call.clone());
    }

    fn broadcast_ended(&self, call: &Call) {
        let topic = Topic::call(&call.id).to_string();
        self.relay
            .publish(&topic, frame::EVENT_CALL_ENDED, json!({ "call": call }));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantFlag {
    Muted,
    VideoOff,
    ScreenSharing,
}

impl ParticipantFlag {
    pub fn key(&self) -> &'static str {
        match self {
            ParticipantFlag::Muted => "is_muted",
            ParticipantFlag::VideoOff => "is_video_off",
            ParticipantFlag::ScreenSharing => "is_screen_sharing",
        }
    }
}
