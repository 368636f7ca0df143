//! The persisted call record and its lifecycle state machine.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a call.
///
/// Transitions are validated by [`CallState::can_transition_to`]; the owning
/// session task is the only writer, so a rejected transition indicates a
/// logic error or a duplicate external event, never a race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Initiated,
    Ringing,
    Answered,
    Active,
    Transferring,
    Transferred,
    Ended,
    Failed,
}

impl CallState {
    /// Terminal states trigger cleanup and admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended | CallState::Failed)
    }

    /// Whether `next` is a legal successor of this state.
    ///
    /// A call that never reaches `answered` (caller hangs up while ringing)
    /// moves straight from `ringing` to `ended`.
    pub fn can_transition_to(&self, next: CallState) -> bool {
        use CallState::*;
        match (self, next) {
            (Initiated, Ringing) => true,
            (Ringing, Answered | Failed | Ended) => true,
            (Answered, Active | Ended | Failed) => true,
            (Active, Transferring | Ended | Failed) => true,
            (Transferring, Transferred | Ended | Failed) => true,
            (Transferred, Ended) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Initiated => "initiated",
            CallState::Ringing => "ringing",
            CallState::Answered => "answered",
            CallState::Active => "active",
            CallState::Transferring => "transferring",
            CallState::Transferred => "transferred",
            CallState::Ended => "ended",
            CallState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Call direction as seen from this service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Rejected state transition.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid call state transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: CallState,
    pub to: CallState,
}

/// The central persisted entity: one record per call, keyed by an internal
/// call id, indexed by the TC-assigned channel id and by tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    /// Internal call id, unique per process lifetime and beyond.
    pub id: String,
    /// Channel id assigned by the telephony control plane.
    pub channel_id: String,
    pub tenant_id: String,
    /// Agent chosen at answer time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Set at most once, after the call reaches `answered`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub direction: Direction,
    pub caller_number: String,
    pub callee_number: String,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Terminal reason, e.g. `completed`, `rejected:capacity`,
    /// `resolution:timeout`, `lost:tc_reset`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<String>,
    /// Diagnostic tags owned by the orchestrator.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Call {
    /// Create a record for an inbound channel that just entered the
    /// application. The record starts in `initiated`; the orchestrator moves
    /// it to `ringing` when it takes ownership.
    pub fn inbound(channel_id: impl Into<String>, caller: impl Into<String>, callee: impl Into<String>) -> Self {
        Self::new(channel_id, caller, callee, Direction::Inbound)
    }

    pub fn outbound(channel_id: impl Into<String>, caller: impl Into<String>, callee: impl Into<String>) -> Self {
        Self::new(channel_id, caller, callee, Direction::Outbound)
    }

    fn new(
        channel_id: impl Into<String>,
        caller: impl Into<String>,
        callee: impl Into<String>,
        direction: Direction,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel_id: channel_id.into(),
            tenant_id: String::new(),
            agent_id: None,
            conversation_id: None,
            direction,
            caller_number: caller.into(),
            callee_number: callee.into(),
            state: CallState::Initiated,
            created_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            end_reason: None,
            metadata: HashMap::new(),
        }
    }

    /// Apply a validated state transition, stamping the answer/end
    /// timestamps as the call crosses them.
    pub fn transition(&mut self, next: CallState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        match next {
            CallState::Answered => self.answered_at = Some(Utc::now()),
            s if s.is_terminal() => self.ended_at = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }

    /// Duration of the answered portion of the call, `None` until both
    /// timestamps exist.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.answered_at, self.ended_at) {
            (Some(answered), Some(ended)) => Some(ended - answered),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut call = Call::inbound("chan-1", "+15550100", "+15550200");
        assert_eq!(call.state, CallState::Initiated);

        for next in [
            CallState::Ringing,
            CallState::Answered,
            CallState::Active,
            CallState::Ended,
        ] {
            call.transition(next).unwrap();
        }
        assert!(call.state.is_terminal());
        assert!(call.answered_at.is_some());
        assert!(call.ended_at.is_some());
        assert!(call.duration().is_some());
    }

    #[test]
    fn test_hangup_while_ringing_bypasses_answered() {
        let mut call = Call::inbound("chan-2", "+15550100", "+15550200");
        call.transition(CallState::Ringing).unwrap();
        call.transition(CallState::Ended).unwrap();
        assert!(call.answered_at.is_none());
        assert!(call.duration().is_none());
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        for terminal in [CallState::Ended, CallState::Failed] {
            for next in [
                CallState::Initiated,
                CallState::Ringing,
                CallState::Answered,
                CallState::Active,
                CallState::Ended,
                CallState::Failed,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_transfer_path() {
        let mut call = Call::inbound("chan-3", "+15550100", "+15550200");
        call.transition(CallState::Ringing).unwrap();
        call.transition(CallState::Answered).unwrap();
        call.transition(CallState::Active).unwrap();
        call.transition(CallState::Transferring).unwrap();
        call.transition(CallState::Transferred).unwrap();
        call.transition(CallState::Ended).unwrap();
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let mut call = Call::inbound("chan-4", "+15550100", "+15550200");
        let err = call.transition(CallState::Active).unwrap_err();
        assert_eq!(err.from, CallState::Initiated);
        assert_eq!(err.to, CallState::Active);
        // The record is untouched on rejection.
        assert_eq!(call.state, CallState::Initiated);
    }

    #[test]
    fn test_serde_round_trip_keeps_state_names() {
        let call = Call::inbound("chan-5", "+15550100", "+15550200");
        let json = serde_json::to_string(&call).unwrap();
        assert!(json.contains("\"initiated\""));
        assert!(json.contains("\"inbound\""));
        let back: Call = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, call.id);
        assert_eq!(back.state, CallState::Initiated);
    }
}
