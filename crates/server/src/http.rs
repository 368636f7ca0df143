//! Operator API and TC webhook ingress.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use voicebridge_core::TransferType;
use voicebridge_telephony::{parse_event, ConnectionState};

use crate::metrics::metrics_handler;
use crate::state::AppState;
use crate::ServerError;

/// JSON error body returned by every endpoint.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace_id: Option<String>,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let error = match &self {
            ServerError::NotFound(_) => "not_found",
            ServerError::Conflict(_) => "conflict",
            ServerError::InvalidRequest(_) => "invalid_request",
            ServerError::Internal(_) => "internal",
            ServerError::Unavailable(_) => "unavailable",
        };
        let body = ErrorBody {
            error,
            message: self.to_string(),
            details: None,
            trace_id: None,
        };
        (StatusCode::from(self), Json(body)).into_response()
    }
}

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Operator call surface
        .route("/calls", post(originate_call))
        .route("/calls/:id", get(get_call))
        .route("/calls/:id", delete(terminate_call))
        .route("/calls/:id/transfer", post(transfer_call))
        .route("/tenants/:tenant_id/calls", get(list_tenant_calls))
        // TC ingress for webhook-configured deployments
        .route("/tc/events", post(tc_webhook))
        // Media feed ingress
        .route("/media/:channel_id", get(media_ws))
        // Health and metrics
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn get_call(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<voicebridge_core::Call>, ServerError> {
    let call = state
        .supervisor
        .get_call(&id)
        .await
        .map_err(ServerError::from)?
        .ok_or_else(|| ServerError::NotFound(id))?;
    Ok(Json(call))
}

/// Forcibly end a call; idempotent.
async fn terminate_call(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ServerError> {
    state
        .supervisor
        .terminate_call(&id, "operator_terminated")
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct TransferRequest {
    #[serde(rename = "type")]
    transfer_type: String,
    target: String,
    #[serde(default)]
    reason: Option<String>,
}

async fn transfer_call(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<TransferRequest>,
) -> Result<StatusCode, ServerError> {
    let transfer_type = match request.transfer_type.as_str() {
        "queue" => TransferType::Queue,
        "agent" => TransferType::Agent,
        "external" => TransferType::External,
        other => {
            return Err(ServerError::InvalidRequest(format!(
                "unknown transfer type {other:?}"
            )))
        }
    };
    if request.target.is_empty() {
        return Err(ServerError::InvalidRequest("target is required".to_string()));
    }
    state
        .supervisor
        .transfer_call(&id, transfer_type, request.target, request.reason)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

async fn list_tenant_calls(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let calls = state.supervisor.list_tenant_calls(&tenant_id).await?;
    let count = calls.len();
    Ok(Json(serde_json::json!({
        "calls": calls,
        "count": count,
    })))
}

#[derive(Debug, Deserialize)]
struct OriginateRequest {
    tenant_id: String,
    endpoint: String,
    #[serde(default)]
    caller_id: String,
}

/// Operator-triggered outbound call.
async fn originate_call(
    State(state): State<AppState>,
    Json(request): Json<OriginateRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ServerError> {
    if request.tenant_id.is_empty() || request.endpoint.is_empty() {
        return Err(ServerError::InvalidRequest(
            "tenant_id and endpoint are required".to_string(),
        ));
    }
    let channel_id = state
        .supervisor
        .originate_call(&request.tenant_id, &request.endpoint, &request.caller_id)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "channel_id": channel_id })),
    ))
}

/// Alternative event ingress when the TC is configured for webhook
/// delivery; the payload is the same JSON shape as the WebSocket events.
async fn tc_webhook(
    State(state): State<AppState>,
    body: String,
) -> Result<StatusCode, ServerError> {
    let event = parse_event(&body)
        .map_err(|e| ServerError::InvalidRequest(format!("malformed TC event: {e}")))?;
    state.supervisor.dispatch(event).await;
    Ok(StatusCode::NO_CONTENT)
}

/// Media feed: binary PCM frames for one channel.
async fn media_ws(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| media_pump(socket, state, channel_id))
}

async fn media_pump(mut socket: WebSocket, state: AppState, channel_id: String) {
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Binary(frame) => {
                if !state.supervisor.feed_audio(&channel_id, frame.into()) {
                    // No owning session (call ended or never existed).
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

/// Liveness: no dependencies consulted.
async fn healthz() -> &'static str {
    "ok"
}

/// Readiness: the KV store answers and the TC link is not down.
async fn readyz(State(state): State<AppState>) -> Response {
    if let Some(redis) = &state.redis {
        if let Err(e) = redis.ping().await {
            return ServerError::Unavailable(format!("store: {e}")).into_response();
        }
    }
    if let Some(reader) = &state.tc_reader {
        if reader.state() == ConnectionState::Disconnected {
            return ServerError::Unavailable("tc link down".to_string()).into_response();
        }
    }
    match state.supervisor.health() {
        voicebridge_pipeline::SupervisorHealth::Serving => {
            (StatusCode::OK, "ready").into_response()
        }
        voicebridge_pipeline::SupervisorHealth::TcLinkDown => {
            ServerError::Unavailable("tc link down".to_string()).into_response()
        }
        voicebridge_pipeline::SupervisorHealth::Draining => {
            ServerError::Unavailable("draining".to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_shape() {
        let response = ServerError::NotFound("call-1".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_transfer_request_parsing() {
        let request: TransferRequest = serde_json::from_str(
            r#"{"type": "queue", "target": "billing", "reason": "caller asked"}"#,
        )
        .unwrap();
        assert_eq!(request.transfer_type, "queue");
        assert_eq!(request.target, "billing");
        assert_eq!(request.reason.as_deref(), Some("caller asked"));
    }
}
