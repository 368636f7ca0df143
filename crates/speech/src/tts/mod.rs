//! Text-to-speech providers.

mod aws;
mod azure;
mod google;

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;

use voicebridge_core::{SpeechError, TtsProvider};

pub use aws::PollyTts;
pub use azure::AzureTts;
pub use google::GoogleTts;

/// Build a TTS provider by name.
pub fn create_tts_provider(
    name: &str,
    provider_config: &serde_json::Value,
) -> Result<Arc<dyn TtsProvider>, SpeechError> {
    match name {
        "google" => Ok(Arc::new(GoogleTts::from_config(provider_config)?)),
        "azure" => Ok(Arc::new(AzureTts::from_config(provider_config)?)),
        "aws" => Ok(Arc::new(PollyTts::from_config(provider_config)?)),
        other => Err(SpeechError::UnknownProvider(other.to_string())),
    }
}

/// Forward a response body into a chunk channel.
///
/// Dropping the receiver makes the next `send` fail, which drops the
/// response and aborts the underlying HTTP transfer. This is the
/// cancellation path barge-in relies on.
pub(crate) fn stream_response(
    response: reqwest::Response,
) -> mpsc::Receiver<Result<Bytes, SpeechError>> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let item = chunk.map_err(|e| SpeechError::Stream(e.to_string()));
            let failed = item.is_err();
            if tx.send(item).await.is_err() || failed {
                return;
            }
        }
    });
    rx
}

/// Shared status check for synthesis responses.
pub(crate) async fn check_synthesis_response(
    response: reqwest::Response,
) -> Result<reqwest::Response, SpeechError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(SpeechError::Provider(format!(
        "synthesis failed: HTTP {status}: {message}"
    )))
}
