//! Seam to the external conversational agent service.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DialogError;

/// Result of opening a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationStart {
    pub conversation_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub agent_name: String,
    /// Initial greeting the agent wants spoken, when it supplies one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
    #[serde(default)]
    pub state: serde_json::Value,
}

/// Action the agent requested alongside (or instead of) its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentActionKind {
    Transfer,
    Escalate,
    End,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentAction {
    pub kind: AgentActionKind,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// One evaluated turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReply {
    pub turn_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<AgentAction>,
    #[serde(default)]
    pub state: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl AgentReply {
    /// Whether the agent considers the conversation finished.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.action,
            Some(AgentAction {
                kind: AgentActionKind::End,
                ..
            })
        ) || self.finish_reason.as_deref() == Some("completed")
    }
}

/// Conversational agent client. The orchestrator keeps at most one turn in
/// flight per conversation; implementations need not serialize internally.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn create_conversation(
        &self,
        tenant_id: &str,
        agent_id: &str,
        initial_state: serde_json::Value,
    ) -> Result<ConversationStart, DialogError>;

    async fn submit_turn(
        &self,
        conversation_id: &str,
        user_text: &str,
        context: Option<serde_json::Value>,
    ) -> Result<AgentReply, DialogError>;

    async fn update_context(
        &self,
        conversation_id: &str,
        patch: serde_json::Value,
    ) -> Result<(), DialogError>;

    async fn end_conversation(
        &self,
        conversation_id: &str,
        reason: Option<&str>,
    ) -> Result<(), DialogError>;
}
