//! Polly synthesis through a signing gateway, streamed as it arrives.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::mpsc;

use voicebridge_core::{AudioEncoding, SpeechError, TtsConfig, TtsProvider};

#[derive(Debug, Clone, Deserialize)]
pub struct PollyConfig {
    /// Synthesis gateway endpoint fronting `POST /v1/speech`; the
    /// orchestrator never holds long-lived AWS credentials itself.
    pub endpoint: String,
    pub api_key: String,
    #[serde(default = "default_engine")]
    pub engine: String,
}

fn default_engine() -> String {
    "neural".to_string()
}

pub struct PollyTts {
    config: PollyConfig,
    client: reqwest::Client,
}

fn output_format(encoding: AudioEncoding) -> Result<&'static str, SpeechError> {
    match encoding {
        AudioEncoding::Pcm | AudioEncoding::Wav => Ok("pcm"),
        AudioEncoding::Mp3 => Ok("mp3"),
        AudioEncoding::Opus => Ok("ogg_vorbis"),
    }
}

impl PollyTts {
    pub fn from_config(value: &serde_json::Value) -> Result<Self, SpeechError> {
        let config: PollyConfig = serde_json::from_value(value.clone())
            .map_err(|e| SpeechError::Configuration(format!("aws tts: {e}")))?;
        Ok(Self {
            config,
            client: reqwest::Client::new(),
        })
    }

    fn request_body(&self, text: &str, config: &TtsConfig) -> Result<serde_json::Value, SpeechError> {
        Ok(serde_json::json!({
            "Engine": self.config.engine,
            "OutputFormat": output_format(config.encoding)?,
            "SampleRate": config.sample_rate.to_string(),
            "Text": text,
            "VoiceId": config.voice_id,
            "LanguageCode": config.language,
        }))
    }

    async fn request(
        &self,
        text: &str,
        config: &TtsConfig,
    ) -> Result<reqwest::Response, SpeechError> {
        let response = self
            .client
            .post(&self.config.endpoint)
            .header("x-api-key", &self.config.api_key)
            .json(&self.request_body(text, config)?)
            .send()
            .await
            .map_err(|e| SpeechError::Provider(e.to_string()))?;
        super::check_synthesis_response(response).await
    }
}

#[async_trait]
impl TtsProvider for PollyTts {
    async fn synthesize(&self, text: &str, config: &TtsConfig) -> Result<Bytes, SpeechError> {
        let response = self.request(text, config).await?;
        response
            .bytes()
            .await
            .map_err(|e| SpeechError::Stream(e.to_string()))
    }

    async fn synthesize_stream(
        &self,
        text: &str,
        config: &TtsConfig,
    ) -> Result<mpsc::Receiver<Result<Bytes, SpeechError>>, SpeechError> {
        let response = self.request(text, config).await?;
        Ok(super::stream_response(response))
    }

    fn name(&self) -> &'static str {
        "aws"
    }
}
