//! Events published to the bus, one envelope shape for every type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::call::{CallState, Direction};

/// Transfer destination kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferType {
    Queue,
    Agent,
    External,
}

/// Which component produced an `error.*` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorComponent {
    Stt,
    Llm,
    Tts,
    Tc,
    Internal,
}

impl ErrorComponent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorComponent::Stt => "stt",
            ErrorComponent::Llm => "llm",
            ErrorComponent::Tts => "tts",
            ErrorComponent::Tc => "tc",
            ErrorComponent::Internal => "internal",
        }
    }
}

/// Typed payload, tagged with the wire event type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum EventPayload {
    #[serde(rename = "call.started")]
    CallStarted {
        direction: Direction,
        caller_number: String,
        callee_number: String,
        state: CallState,
    },
    #[serde(rename = "call.answered")]
    CallAnswered {
        direction: Direction,
        caller_number: String,
        callee_number: String,
        state: CallState,
    },
    #[serde(rename = "call.ended")]
    CallEnded {
        direction: Direction,
        caller_number: String,
        callee_number: String,
        state: CallState,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<i64>,
    },
    #[serde(rename = "call.transferred")]
    CallTransferred {
        transfer_type: TransferType,
        target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename = "stt.transcribed")]
    SttTranscribed {
        text: String,
        confidence: f32,
        is_final: bool,
        provider: String,
        latency_ms: u64,
    },
    #[serde(rename = "llm.responded")]
    LlmResponded {
        agent_id: String,
        response_text: String,
        latency_ms: u64,
    },
    #[serde(rename = "tts.generated")]
    TtsGenerated {
        text: String,
        provider: String,
        voice_id: String,
        latency_ms: u64,
        audio_bytes: usize,
    },
    #[serde(rename = "error")]
    Error {
        error_type: ErrorComponent,
        message: String,
        component: String,
    },
}

impl EventPayload {
    /// Wire event type; also the topic suffix under the configured prefix.
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::CallStarted { .. } => "call.started",
            EventPayload::CallAnswered { .. } => "call.answered",
            EventPayload::CallEnded { .. } => "call.ended",
            EventPayload::CallTransferred { .. } => "call.transferred",
            EventPayload::SttTranscribed { .. } => "stt.transcribed",
            EventPayload::LlmResponded { .. } => "llm.responded",
            EventPayload::TtsGenerated { .. } => "tts.generated",
            EventPayload::Error { error_type, .. } => match error_type {
                ErrorComponent::Stt => "error.stt",
                ErrorComponent::Llm => "error.llm",
                ErrorComponent::Tts => "error.tts",
                ErrorComponent::Tc => "error.tc",
                ErrorComponent::Internal => "error.internal",
            },
        }
    }
}

/// Envelope carried by every record on the bus. The call id doubles as the
/// partition key so all events of one call stay totally ordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub call_id: String,
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl CallEvent {
    pub fn new(call_id: impl Into<String>, tenant_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            call_id: call_id.into(),
            tenant_id: tenant_id.into(),
            conversation_id: None,
            trace_id: None,
            payload,
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_strings() {
        let ev = CallEvent::new(
            "c1",
            "t1",
            EventPayload::Error {
                error_type: ErrorComponent::Llm,
                message: "deadline exceeded".into(),
                component: "agent-client".into(),
            },
        );
        assert_eq!(ev.event_type(), "error.llm");
    }

    #[test]
    fn test_envelope_serialization_is_flat() {
        let ev = CallEvent::new(
            "c1",
            "t1",
            EventPayload::SttTranscribed {
                text: "hello".into(),
                confidence: 0.93,
                is_final: true,
                provider: "google".into(),
                latency_ms: 180,
            },
        )
        .with_conversation("conv-1");

        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event_type"], "stt.transcribed");
        assert_eq!(json["call_id"], "c1");
        assert_eq!(json["conversation_id"], "conv-1");
        assert_eq!(json["is_final"], true);
        // No nested payload object: headers and payload share one level.
        assert!(json.get("payload").is_none());
    }

    #[test]
    fn test_envelope_round_trip() {
        let ev = CallEvent::new(
            "c2",
            "t2",
            EventPayload::CallEnded {
                direction: Direction::Inbound,
                caller_number: "+15550100".into(),
                callee_number: "+15550200".into(),
                state: CallState::Ended,
                reason: "completed".into(),
                duration_ms: Some(42_000),
            },
        );
        let json = serde_json::to_string(&ev).unwrap();
        let back: CallEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type(), "call.ended");
        assert_eq!(back.call_id, "c2");
    }
}
