//! AWS Transcribe streaming recognition via a presigned WebSocket URL.

use async_trait::async_trait;
use serde::Deserialize;

use voicebridge_core::{SpeechError, SttConfig, SttProvider, SttStream, TranscriptResult};

use super::{open_ws_stream, WsDialect};

#[derive(Debug, Clone, Deserialize)]
pub struct AwsTranscribeConfig {
    /// Presigning gateway that mints streaming URLs; the orchestrator never
    /// holds long-lived AWS credentials itself.
    pub presign_endpoint: String,
    pub api_key: String,
    #[serde(default)]
    pub vocabulary_name: Option<String>,
}

pub struct AwsTranscribeStt {
    config: AwsTranscribeConfig,
    client: reqwest::Client,
}

impl AwsTranscribeStt {
    pub fn from_config(value: &serde_json::Value) -> Result<Self, SpeechError> {
        let config: AwsTranscribeConfig = serde_json::from_value(value.clone())
            .map_err(|e| SpeechError::Configuration(format!("aws stt: {e}")))?;
        let client = reqwest::Client::new();
        Ok(Self { config, client })
    }

    /// Fetch a presigned streaming URL for one recognition session.
    async fn presign(&self, config: &SttConfig) -> Result<String, SpeechError> {
        #[derive(Deserialize)]
        struct Presigned {
            url: String,
        }

        let response = self
            .client
            .post(&self.config.presign_endpoint)
            .header("x-api-key", &self.config.api_key)
            .json(&serde_json::json!({
                "language_code": config.language,
                "media_sample_rate_hertz": config.sample_rate,
                "media_encoding": "pcm",
                "vocabulary_name": self.config.vocabulary_name,
            }))
            .send()
            .await
            .map_err(|e| SpeechError::Provider(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SpeechError::Provider(format!(
                "presign failed: HTTP {}",
                response.status()
            )));
        }
        let presigned: Presigned = response
            .json()
            .await
            .map_err(|e| SpeechError::Protocol(e.to_string()))?;
        Ok(presigned.url)
    }
}

struct AwsDialect;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TranscriptFrame {
    #[serde(default)]
    transcript: Option<TranscriptBody>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TranscriptBody {
    #[serde(default)]
    results: Vec<AwsResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsResult {
    #[serde(default)]
    is_partial: bool,
    #[serde(default)]
    alternatives: Vec<AwsAlternative>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsAlternative {
    #[serde(default)]
    transcript: String,
}

impl WsDialect for AwsDialect {
    fn open_frame(&self) -> Option<String> {
        None
    }

    fn close_frame(&self) -> Option<String> {
        // Empty audio event signals end-of-stream.
        Some(r#"{"AudioEvent": {"AudioChunk": ""}}"#.to_string())
    }

    fn parse_frame(&self, text: &str) -> Option<Result<TranscriptResult, SpeechError>> {
        let frame: TranscriptFrame = match serde_json::from_str(text) {
            Ok(f) => f,
            Err(e) => return Some(Err(SpeechError::Protocol(e.to_string()))),
        };
        if let Some(message) = frame.message {
            return Some(Err(SpeechError::Provider(message)));
        }
        let result = frame.transcript?.results.into_iter().next()?;
        let mut alternatives = result.alternatives.into_iter();
        let best = alternatives.next()?;
        if best.transcript.is_empty() {
            return None;
        }
        Some(Ok(TranscriptResult {
            text: best.transcript,
            // Transcribe reports no utterance confidence on the stream.
            confidence: if result.is_partial { 0.0 } else { 1.0 },
            is_final: !result.is_partial,
            alternatives: alternatives.map(|a| a.transcript).collect(),
        }))
    }
}

#[async_trait]
impl SttProvider for AwsTranscribeStt {
    async fn open_stream(&self, config: &SttConfig) -> Result<SttStream, SpeechError> {
        let url = self.presign(config).await?;
        open_ws_stream(&url, &[], AwsDialect).await
    }

    fn name(&self) -> &'static str {
        "aws"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_and_final_frames() {
        let partial = r#"{"Transcript": {"Results": [
            {"IsPartial": true, "Alternatives": [{"Transcript": "my account"}]}
        ]}}"#;
        let parsed = AwsDialect.parse_frame(partial).unwrap().unwrap();
        assert!(!parsed.is_final);

        let final_frame = r#"{"Transcript": {"Results": [
            {"IsPartial": false, "Alternatives": [{"Transcript": "my account number is four"}]}
        ]}}"#;
        let parsed = AwsDialect.parse_frame(final_frame).unwrap().unwrap();
        assert!(parsed.is_final);
        assert_eq!(parsed.text, "my account number is four");
    }

    #[test]
    fn test_keepalive_frame_is_skipped() {
        assert!(AwsDialect
            .parse_frame(r#"{"Transcript": {"Results": []}}"#)
            .is_none());
    }

    #[test]
    fn test_exception_frame_is_an_error() {
        let frame = r#"{"Message": "The security token included in the request is expired"}"#;
        assert!(AwsDialect.parse_frame(frame).unwrap().is_err());
    }
}
