//! Google streaming recognition via the speech gateway endpoint.

use async_trait::async_trait;
use serde::Deserialize;

use voicebridge_core::{SpeechError, SttConfig, SttProvider, SttStream, TranscriptResult};

use super::{open_ws_stream, WsDialect};

/// Connection settings, taken from the tenant's opaque provider config.
#[derive(Debug, Clone, Deserialize)]
pub struct GoogleSttConfig {
    /// Streaming-recognize gateway endpoint, e.g.
    /// `wss://speech.googleapis.com/v1/speech:streamingRecognize`.
    pub endpoint: String,
    pub api_key: String,
    #[serde(default)]
    pub model: Option<String>,
}

pub struct GoogleStt {
    config: GoogleSttConfig,
}

impl GoogleStt {
    pub fn from_config(value: &serde_json::Value) -> Result<Self, SpeechError> {
        let config: GoogleSttConfig = serde_json::from_value(value.clone())
            .map_err(|e| SpeechError::Configuration(format!("google stt: {e}")))?;
        Ok(Self { config })
    }
}

struct GoogleDialect {
    open: String,
}

#[derive(Debug, Deserialize)]
struct StreamingResponse {
    #[serde(default)]
    results: Vec<StreamingResult>,
    #[serde(default)]
    error: Option<StreamingStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamingResult {
    #[serde(default)]
    alternatives: Vec<StreamingAlternative>,
    #[serde(default)]
    is_final: bool,
}

#[derive(Debug, Deserialize)]
struct StreamingAlternative {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    confidence: f32,
}

#[derive(Debug, Deserialize)]
struct StreamingStatus {
    #[serde(default)]
    message: String,
}

impl WsDialect for GoogleDialect {
    fn open_frame(&self) -> Option<String> {
        Some(self.open.clone())
    }

    fn close_frame(&self) -> Option<String> {
        None
    }

    fn parse_frame(&self, text: &str) -> Option<Result<TranscriptResult, SpeechError>> {
        let response: StreamingResponse = match serde_json::from_str(text) {
            Ok(r) => r,
            Err(e) => return Some(Err(SpeechError::Protocol(e.to_string()))),
        };
        if let Some(status) = response.error {
            return Some(Err(SpeechError::Provider(status.message)));
        }
        let result = response.results.into_iter().next()?;
        let mut alternatives = result.alternatives.into_iter();
        let best = alternatives.next()?;
        Some(Ok(TranscriptResult {
            text: best.transcript,
            confidence: best.confidence,
            is_final: result.is_final,
            alternatives: alternatives.map(|a| a.transcript).collect(),
        }))
    }
}

#[async_trait]
impl SttProvider for GoogleStt {
    async fn open_stream(&self, config: &SttConfig) -> Result<SttStream, SpeechError> {
        let open = serde_json::json!({
            "streamingConfig": {
                "config": {
                    "encoding": match config.encoding {
                        voicebridge_core::AudioEncoding::Pcm => "LINEAR16",
                        other => return Err(SpeechError::Configuration(
                            format!("google stt does not accept {} input", other.as_str()),
                        )),
                    },
                    "sampleRateHertz": config.sample_rate,
                    "languageCode": config.language,
                    "model": self.config.model,
                },
                "interimResults": config.interim_results,
                "singleUtterance": config.single_utterance,
            }
        })
        .to_string();

        let url = format!("{}?key={}", self.config.endpoint, self.config.api_key);
        open_ws_stream(&url, &[], GoogleDialect { open }).await
    }

    fn name(&self) -> &'static str {
        "google"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_interim_and_final() {
        let dialect = GoogleDialect { open: String::new() };

        let interim = r#"{"results": [{"alternatives": [{"transcript": "i need", "confidence": 0.4}], "isFinal": false}]}"#;
        let parsed = dialect.parse_frame(interim).unwrap().unwrap();
        assert_eq!(parsed.text, "i need");
        assert!(!parsed.is_final);

        let final_frame = r#"{"results": [{"alternatives": [
            {"transcript": "i need help with my bill", "confidence": 0.93},
            {"transcript": "i need help with my bell", "confidence": 0.41}
        ], "isFinal": true}]}"#;
        let parsed = dialect.parse_frame(final_frame).unwrap().unwrap();
        assert!(parsed.is_final);
        assert_eq!(parsed.alternatives, vec!["i need help with my bell"]);
    }

    #[test]
    fn test_empty_response_frame_is_skipped() {
        let dialect = GoogleDialect { open: String::new() };
        assert!(dialect.parse_frame(r#"{"results": []}"#).is_none());
    }

    #[test]
    fn test_error_frame_surfaces_provider_error() {
        let dialect = GoogleDialect { open: String::new() };
        let err = dialect
            .parse_frame(r#"{"error": {"message": "quota exceeded"}}"#)
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, SpeechError::Provider(m) if m == "quota exceeded"));
    }

    #[test]
    fn test_config_requires_endpoint_and_key() {
        assert!(GoogleStt::from_config(&serde_json::json!({})).is_err());
        assert!(GoogleStt::from_config(&serde_json::json!({
            "endpoint": "wss://speech.googleapis.com/v1/speech:streamingRecognize",
            "api_key": "k"
        }))
        .is_ok());
    }
}
