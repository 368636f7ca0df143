//! HTTP client for the conversational agent service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};

use voicebridge_core::{
    AgentAction, AgentActionKind, AgentClient, AgentReply, ConversationStart, DialogError,
};

/// JSON client for the agent service. One request per turn, bounded by the
/// configured deadline; the orchestrator keeps at most one turn in flight
/// per conversation.
pub struct HttpAgentClient {
    base_url: String,
    client: Client,
}

#[derive(Debug, Serialize)]
struct CreateConversationRequest<'a> {
    tenant_id: &'a str,
    agent_id: &'a str,
    channel: &'static str,
    initial_state: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CreateConversationResponse {
    conversation_id: String,
    agent_id: String,
    #[serde(default)]
    agent_name: String,
    #[serde(default)]
    greeting: Option<String>,
    #[serde(default)]
    state: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct TurnRequest<'a> {
    user_message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TurnResponse {
    turn_id: String,
    agent_response: String,
    #[serde(default)]
    intent: Option<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    action_params: serde_json::Value,
    #[serde(default)]
    state: serde_json::Value,
    #[serde(default)]
    finish_reason: Option<String>,
}

fn parse_action(
    action: Option<String>,
    params: serde_json::Value,
) -> Result<Option<AgentAction>, DialogError> {
    let Some(name) = action else {
        return Ok(None);
    };
    let kind = match name.as_str() {
        "transfer" => AgentActionKind::Transfer,
        "escalate" => AgentActionKind::Escalate,
        "end" => AgentActionKind::End,
        "tool" => AgentActionKind::Tool,
        other => {
            return Err(DialogError::InvalidResponse(format!(
                "unknown agent action {other:?}"
            )))
        }
    };
    Ok(Some(AgentAction { kind, params }))
}

impl HttpAgentClient {
    pub fn new(base_url: impl Into<String>, turn_deadline: Duration) -> Result<Self, DialogError> {
        let client = Client::builder()
            .timeout(turn_deadline)
            .build()
            .map_err(|e| DialogError::Network(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn check(response: Response) -> Result<Response, DialogError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::NOT_FOUND {
            Err(DialogError::NotFound(message))
        } else if status.is_client_error() {
            Err(DialogError::Api {
                status: status.as_u16(),
                message,
            })
        } else {
            Err(DialogError::Server {
                status: status.as_u16(),
                message,
            })
        }
    }

    fn map_send_error(err: reqwest::Error) -> DialogError {
        if err.is_timeout() {
            DialogError::Timeout
        } else {
            DialogError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn create_conversation(
        &self,
        tenant_id: &str,
        agent_id: &str,
        initial_state: serde_json::Value,
    ) -> Result<ConversationStart, DialogError> {
        let response = self
            .client
            .post(self.url("/conversations"))
            .json(&CreateConversationRequest {
                tenant_id,
                agent_id,
                channel: "voice",
                initial_state,
            })
            .send()
            .await
            .map_err(Self::map_send_error)?;
        let response = Self::check(response).await?;

        let body: CreateConversationResponse = response
            .json()
            .await
            .map_err(|e| DialogError::InvalidResponse(e.to_string()))?;
        Ok(ConversationStart {
            conversation_id: body.conversation_id,
            agent_id: body.agent_id,
            agent_name: body.agent_name,
            greeting: body.greeting,
            state: body.state,
        })
    }

    async fn submit_turn(
        &self,
        conversation_id: &str,
        user_text: &str,
        context: Option<serde_json::Value>,
    ) -> Result<AgentReply, DialogError> {
        let response = self
            .client
            .post(self.url(&format!("/conversations/{conversation_id}/turns")))
            .json(&TurnRequest {
                user_message: user_text,
                context,
            })
            .send()
            .await
            .map_err(Self::map_send_error)?;
        let response = Self::check(response).await?;

        let body: TurnResponse = response
            .json()
            .await
            .map_err(|e| DialogError::InvalidResponse(e.to_string()))?;
        Ok(AgentReply {
            turn_id: body.turn_id,
            text: body.agent_response,
            intent: body.intent,
            action: parse_action(body.action, body.action_params)?,
            state: body.state,
            finish_reason: body.finish_reason,
        })
    }

    async fn update_context(
        &self,
        conversation_id: &str,
        patch: serde_json::Value,
    ) -> Result<(), DialogError> {
        let response = self
            .client
            .patch(self.url(&format!("/conversations/{conversation_id}/context")))
            .json(&serde_json::json!({ "context": patch }))
            .send()
            .await
            .map_err(Self::map_send_error)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn end_conversation(
        &self,
        conversation_id: &str,
        reason: Option<&str>,
    ) -> Result<(), DialogError> {
        let response = self
            .client
            .post(self.url(&format!("/conversations/{conversation_id}/end")))
            .json(&serde_json::json!({ "reason": reason }))
            .send()
            .await
            .map_err(Self::map_send_error)?;
        match Self::check(response).await {
            Ok(_) => Ok(()),
            // Ending an already-ended conversation is fine.
            Err(DialogError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_response_parsing() {
        let json = r#"{
            "turn_id": "t-7",
            "agent_response": "Sure, can you share your account number?",
            "intent": "billing_help",
            "action": null,
            "state": {"step": "collect_account"},
            "finish_reason": null
        }"#;
        let body: TurnResponse = serde_json::from_str(json).unwrap();
        assert_eq!(body.turn_id, "t-7");
        assert!(parse_action(body.action, body.action_params)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_transfer_action_parsing() {
        let action = parse_action(
            Some("transfer".to_string()),
            serde_json::json!({"type": "queue", "target": "billing"}),
        )
        .unwrap()
        .unwrap();
        assert_eq!(action.kind, AgentActionKind::Transfer);
        assert_eq!(action.params["target"], "billing");
    }

    #[test]
    fn test_unknown_action_is_a_contract_violation() {
        let err = parse_action(Some("reboot".to_string()), serde_json::Value::Null).unwrap_err();
        assert!(matches!(err, DialogError::InvalidResponse(_)));
    }

    #[test]
    fn test_turn_request_omits_empty_context() {
        let request = TurnRequest {
            user_message: "hello",
            context: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains("context"));
    }
}
