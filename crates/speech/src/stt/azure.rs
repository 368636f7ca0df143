//! Azure Speech streaming recognition.

use async_trait::async_trait;
use serde::Deserialize;

use voicebridge_core::{SpeechError, SttConfig, SttProvider, SttStream, TranscriptResult};

use super::{open_ws_stream, WsDialect};

#[derive(Debug, Clone, Deserialize)]
pub struct AzureSttConfig {
    /// Service region, e.g. `eastus`.
    pub region: String,
    pub subscription_key: String,
}

pub struct AzureStt {
    config: AzureSttConfig,
}

impl AzureStt {
    pub fn from_config(value: &serde_json::Value) -> Result<Self, SpeechError> {
        let config: AzureSttConfig = serde_json::from_value(value.clone())
            .map_err(|e| SpeechError::Configuration(format!("azure stt: {e}")))?;
        Ok(Self { config })
    }
}

struct AzureDialect;

/// Azure phrase frames: `speech.hypothesis` while recognizing,
/// `speech.phrase` with `RecognitionStatus: "Success"` for finals.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AzureFrame {
    #[serde(default)]
    recognition_status: Option<String>,
    #[serde(default)]
    display_text: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    n_best: Vec<AzureNBest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AzureNBest {
    #[serde(default)]
    display: String,
    #[serde(default)]
    confidence: f32,
}

impl WsDialect for AzureDialect {
    fn open_frame(&self) -> Option<String> {
        None
    }

    fn close_frame(&self) -> Option<String> {
        None
    }

    fn parse_frame(&self, text: &str) -> Option<Result<TranscriptResult, SpeechError>> {
        let frame: AzureFrame = match serde_json::from_str(text) {
            Ok(f) => f,
            Err(e) => return Some(Err(SpeechError::Protocol(e.to_string()))),
        };

        match frame.recognition_status.as_deref() {
            // Hypothesis frames carry no status.
            None => {
                let hypothesis = frame.text?;
                if hypothesis.is_empty() {
                    return None;
                }
                Some(Ok(TranscriptResult::interim(hypothesis, 0.0)))
            }
            Some("Success") => {
                let mut candidates = frame.n_best.into_iter();
                let (confidence, alternatives) = match candidates.next() {
                    Some(best) => (
                        best.confidence,
                        candidates.map(|c| c.display).collect::<Vec<_>>(),
                    ),
                    None => (0.0, Vec::new()),
                };
                Some(Ok(TranscriptResult {
                    text: frame.display_text.unwrap_or_default(),
                    confidence,
                    is_final: true,
                    alternatives,
                }))
            }
            // Silence / no-match frames carry no transcript.
            Some("InitialSilenceTimeout") | Some("NoMatch") => None,
            Some(other) => Some(Err(SpeechError::Provider(format!(
                "recognition failed: {other}"
            )))),
        }
    }
}

#[async_trait]
impl SttProvider for AzureStt {
    async fn open_stream(&self, config: &SttConfig) -> Result<SttStream, SpeechError> {
        let url = format!(
            "wss://{}.stt.speech.microsoft.com/speech/recognition/conversation/cognitiveservices/v1?language={}&format=detailed",
            self.config.region, config.language,
        );
        let headers = [(
            "Ocp-Apim-Subscription-Key",
            self.config.subscription_key.clone(),
        )];
        open_ws_stream(&url, &headers, AzureDialect).await
    }

    fn name(&self) -> &'static str {
        "azure"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hypothesis_is_interim() {
        let frame = r#"{"Text": "wait wa", "Offset": 100, "Duration": 500}"#;
        let parsed = AzureDialect.parse_frame(frame).unwrap().unwrap();
        assert_eq!(parsed.text, "wait wa");
        assert!(!parsed.is_final);
    }

    #[test]
    fn test_phrase_is_final_with_nbest() {
        let frame = r#"{
            "RecognitionStatus": "Success",
            "DisplayText": "Wait, wait.",
            "NBest": [
                {"Display": "Wait, wait.", "Confidence": 0.91},
                {"Display": "Wade, wade.", "Confidence": 0.12}
            ]
        }"#;
        let parsed = AzureDialect.parse_frame(frame).unwrap().unwrap();
        assert!(parsed.is_final);
        assert_eq!(parsed.text, "Wait, wait.");
        assert!((parsed.confidence - 0.91).abs() < f32::EPSILON);
        assert_eq!(parsed.alternatives, vec!["Wade, wade."]);
    }

    #[test]
    fn test_silence_frames_are_skipped() {
        let frame = r#"{"RecognitionStatus": "InitialSilenceTimeout"}"#;
        assert!(AzureDialect.parse_frame(frame).is_none());
    }

    #[test]
    fn test_failure_status_is_an_error() {
        let frame = r#"{"RecognitionStatus": "Error"}"#;
        assert!(AzureDialect.parse_frame(frame).unwrap().is_err());
    }
}
