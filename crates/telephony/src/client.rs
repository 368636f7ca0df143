//! REST request surface of the TC.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;

use voicebridge_core::{
    ChannelInfo, HangupReason, PlaybackHandle, PlaybackSource, TelephonyClient, TelephonyError,
};

/// Retries for idempotent requests that failed with a retryable error.
const IDEMPOTENT_RETRIES: u32 = 2;
const RETRY_DELAY: Duration = Duration::from_millis(200);

/// TC REST connection settings.
#[derive(Debug, Clone)]
pub struct AriConfig {
    /// Base URL, e.g. `http://tc:8088/ari`.
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// Stasis application registered by this service.
    pub app_name: String,
    pub request_timeout: Duration,
}

impl AriConfig {
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        app_name: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            username: username.into(),
            password: password.into(),
            app_name: app_name.into(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// ARI-style REST client. Safe for concurrent use; every request carries
/// basic auth and the configured deadline.
pub struct AriClient {
    config: AriConfig,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct PlaybackResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct BridgeResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ChannelResponse {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    caller: PartyResponse,
    #[serde(default)]
    connected: PartyResponse,
}

#[derive(Debug, Default, Deserialize)]
struct PartyResponse {
    #[serde(default)]
    number: String,
    #[serde(default)]
    name: String,
}

impl AriClient {
    pub fn new(config: AriConfig) -> Result<Self, TelephonyError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TelephonyError::Network(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.basic_auth(&self.config.username, Some(&self.config.password))
    }

    /// Map an HTTP response to the error taxonomy: 4xx is final, 5xx is
    /// retryable, transport errors are retryable.
    async fn check(&self, response: Response) -> Result<Response, TelephonyError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(TelephonyError::Api {
                status: status.as_u16(),
                message,
            })
        } else {
            Err(TelephonyError::Server {
                status: status.as_u16(),
                message,
            })
        }
    }

    fn map_send_error(err: reqwest::Error) -> TelephonyError {
        if err.is_timeout() {
            TelephonyError::Timeout
        } else {
            TelephonyError::Network(err.to_string())
        }
    }

    /// Issue an idempotent request, retrying retryable failures a bounded
    /// number of times.
    async fn send_idempotent<F>(&self, build: F) -> Result<Response, TelephonyError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut last_err = None;
        for attempt in 0..=IDEMPOTENT_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(RETRY_DELAY * attempt).await;
            }
            let result = match self.authed(build()).send().await {
                Ok(response) => self.check(response).await,
                Err(e) => Err(Self::map_send_error(e)),
            };
            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < IDEMPOTENT_RETRIES => {
                    tracing::debug!(attempt, error = %e, "retrying TC request");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or(TelephonyError::Timeout))
    }
}

#[async_trait]
impl TelephonyClient for AriClient {
    async fn answer(&self, channel_id: &str) -> Result<(), TelephonyError> {
        let url = self.url(&format!("/channels/{channel_id}/answer"));
        match self.send_idempotent(|| self.client.post(&url)).await {
            Ok(_) => Ok(()),
            // Answering an already-answered channel is a success.
            Err(TelephonyError::Api { status: 409, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn play(
        &self,
        channel_id: &str,
        source: PlaybackSource,
    ) -> Result<PlaybackHandle, TelephonyError> {
        let response = match source {
            PlaybackSource::MediaUri(uri) => {
                let url = self.url(&format!("/channels/{channel_id}/play"));
                let response = self
                    .authed(self.client.post(&url).query(&[("media", uri.as_str())]))
                    .send()
                    .await
                    .map_err(Self::map_send_error)?;
                self.check(response).await?
            }
            PlaybackSource::Audio {
                data,
                encoding,
                sample_rate,
            } => {
                // Inline media: TCs compatible with this service accept raw
                // audio on the playback endpoint and stream it themselves.
                let url = self.url(&format!("/channels/{channel_id}/play/media"));
                let response = self
                    .authed(
                        self.client
                            .post(&url)
                            .query(&[("sample_rate", sample_rate.to_string())])
                            .header("content-type", encoding.content_type())
                            .body(data),
                    )
                    .send()
                    .await
                    .map_err(Self::map_send_error)?;
                self.check(response).await?
            }
        };

        let playback: PlaybackResponse = response
            .json()
            .await
            .map_err(|e| TelephonyError::InvalidResponse(e.to_string()))?;
        Ok(PlaybackHandle(playback.id))
    }

    async fn stop_playback(&self, handle: &PlaybackHandle) -> Result<(), TelephonyError> {
        let url = self.url(&format!("/playbacks/{}", handle.0));
        match self.send_idempotent(|| self.client.delete(&url)).await {
            Ok(_) => Ok(()),
            // Already finished: nothing left to stop.
            Err(TelephonyError::Api { status: 404, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn hangup(
        &self,
        channel_id: &str,
        reason: Option<HangupReason>,
    ) -> Result<(), TelephonyError> {
        let url = self.url(&format!("/channels/{channel_id}"));
        let reason = reason.unwrap_or(HangupReason::Normal);
        let result = self
            .send_idempotent(|| {
                self.client
                    .delete(&url)
                    .query(&[("reason", reason.as_str())])
            })
            .await;
        match result {
            Ok(_) => Ok(()),
            // The channel is already gone; the goal state holds.
            Err(TelephonyError::Api { status: 404, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn create_bridge(&self, kind: &str) -> Result<String, TelephonyError> {
        let url = self.url("/bridges");
        let response = self
            .authed(self.client.post(&url).query(&[("type", kind)]))
            .send()
            .await
            .map_err(Self::map_send_error)?;
        let response = self.check(response).await?;
        let bridge: BridgeResponse = response
            .json()
            .await
            .map_err(|e| TelephonyError::InvalidResponse(e.to_string()))?;
        Ok(bridge.id)
    }

    async fn add_to_bridge(
        &self,
        bridge_id: &str,
        channel_id: &str,
    ) -> Result<(), TelephonyError> {
        let url = self.url(&format!("/bridges/{bridge_id}/addChannel"));
        self.send_idempotent(|| self.client.post(&url).query(&[("channel", channel_id)]))
            .await?;
        Ok(())
    }

    async fn originate(&self, endpoint: &str, caller_id: &str) -> Result<String, TelephonyError> {
        let url = self.url("/channels");
        // Dial-outs are not idempotent: one attempt, no retry.
        let response = self
            .authed(self.client.post(&url).query(&[
                ("endpoint", endpoint),
                ("app", self.config.app_name.as_str()),
                ("callerId", caller_id),
            ]))
            .send()
            .await
            .map_err(Self::map_send_error)?;
        let response = self.check(response).await?;
        let channel: ChannelResponse = response
            .json()
            .await
            .map_err(|e| TelephonyError::InvalidResponse(e.to_string()))?;
        Ok(channel.id)
    }

    async fn channel_info(
        &self,
        channel_id: &str,
    ) -> Result<Option<ChannelInfo>, TelephonyError> {
        let url = self.url(&format!("/channels/{channel_id}"));
        let response = self
            .authed(self.client.get(&url))
            .send()
            .await
            .map_err(Self::map_send_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = self.check(response).await?;
        let channel: ChannelResponse = response
            .json()
            .await
            .map_err(|e| TelephonyError::InvalidResponse(e.to_string()))?;
        Ok(Some(ChannelInfo {
            id: channel.id,
            name: channel.name,
            state: channel.state,
            caller_number: channel.caller.number,
            caller_name: channel.caller.name,
            connected_number: channel.connected.number,
            connected_name: channel.connected.name,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joining() {
        let client = AriClient::new(AriConfig::new(
            "http://tc:8088/ari/",
            "user",
            "pass",
            "voicebridge",
        ))
        .unwrap();
        assert_eq!(
            client.url("/channels/c1/answer"),
            "http://tc:8088/ari/channels/c1/answer"
        );
    }

    #[test]
    fn test_channel_response_parsing() {
        let json = r#"{
            "id": "c1",
            "name": "PJSIP/trunk-0001",
            "state": "Up",
            "caller": {"number": "+15550100", "name": "Alice"},
            "connected": {"number": "+15550200", "name": ""}
        }"#;
        let channel: ChannelResponse = serde_json::from_str(json).unwrap();
        assert_eq!(channel.id, "c1");
        assert_eq!(channel.caller.number, "+15550100");
    }
}
