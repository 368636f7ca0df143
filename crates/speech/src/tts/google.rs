//! Google text synthesis over the REST surface.
//!
//! The API returns the whole utterance as base64 JSON, so the streaming
//! variant synthesizes first and then chunks locally; cancellation between
//! chunks is still cheap because nothing further is fetched.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::mpsc;

use voicebridge_core::{AudioEncoding, SpeechError, TtsConfig, TtsProvider};

const LOCAL_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleTtsConfig {
    /// e.g. `https://texttospeech.googleapis.com/v1/text:synthesize`.
    pub endpoint: String,
    pub api_key: String,
}

pub struct GoogleTts {
    config: GoogleTtsConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeResponse {
    audio_content: String,
}

fn encoding_name(encoding: AudioEncoding) -> &'static str {
    match encoding {
        AudioEncoding::Pcm | AudioEncoding::Wav => "LINEAR16",
        AudioEncoding::Mp3 => "MP3",
        AudioEncoding::Opus => "OGG_OPUS",
    }
}

impl GoogleTts {
    pub fn from_config(value: &serde_json::Value) -> Result<Self, SpeechError> {
        let config: GoogleTtsConfig = serde_json::from_value(value.clone())
            .map_err(|e| SpeechError::Configuration(format!("google tts: {e}")))?;
        Ok(Self {
            config,
            client: reqwest::Client::new(),
        })
    }

    fn request_body(&self, text: &str, config: &TtsConfig) -> serde_json::Value {
        serde_json::json!({
            "input": {"text": text},
            "voice": {
                "languageCode": config.language,
                "name": config.voice_id,
            },
            "audioConfig": {
                "audioEncoding": encoding_name(config.encoding),
                "sampleRateHertz": config.sample_rate,
                "speakingRate": config.rate,
                "pitch": semitones(config.pitch),
                "volumeGainDb": gain_db(config.volume),
            }
        })
    }
}

/// Map the unit-relative pitch knob onto the API's semitone scale.
fn semitones(pitch: f32) -> f32 {
    (pitch - 1.0) * 12.0
}

/// Map the unit-relative volume knob onto decibels.
fn gain_db(volume: f32) -> f32 {
    if volume <= 0.0 {
        -96.0
    } else {
        20.0 * volume.log10()
    }
}

#[async_trait]
impl TtsProvider for GoogleTts {
    async fn synthesize(&self, text: &str, config: &TtsConfig) -> Result<Bytes, SpeechError> {
        let url = format!("{}?key={}", self.config.endpoint, self.config.api_key);
        let response = self
            .client
            .post(&url)
            .json(&self.request_body(text, config))
            .send()
            .await
            .map_err(|e| SpeechError::Provider(e.to_string()))?;
        let response = super::check_synthesis_response(response).await?;

        let body: SynthesizeResponse = response
            .json()
            .await
            .map_err(|e| SpeechError::Protocol(e.to_string()))?;
        let audio = BASE64
            .decode(body.audio_content)
            .map_err(|e| SpeechError::Protocol(format!("bad audio payload: {e}")))?;
        Ok(Bytes::from(audio))
    }

    async fn synthesize_stream(
        &self,
        text: &str,
        config: &TtsConfig,
    ) -> Result<mpsc::Receiver<Result<Bytes, SpeechError>>, SpeechError> {
        let audio = self.synthesize(text, config).await?;
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for chunk in audio.chunks(LOCAL_CHUNK_BYTES) {
                if tx.send(Ok(Bytes::copy_from_slice(chunk))).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    fn name(&self) -> &'static str {
        "google"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shape() {
        let provider = GoogleTts::from_config(&serde_json::json!({
            "endpoint": "https://texttospeech.googleapis.com/v1/text:synthesize",
            "api_key": "k"
        }))
        .unwrap();

        let config = TtsConfig {
            language: "en-US".into(),
            voice_id: "en-US-Neural2-C".into(),
            sample_rate: 16_000,
            ..TtsConfig::default()
        };
        let body = provider.request_body("Hello, this is Acme.", &config);
        assert_eq!(body["input"]["text"], "Hello, this is Acme.");
        assert_eq!(body["voice"]["name"], "en-US-Neural2-C");
        assert_eq!(body["audioConfig"]["audioEncoding"], "LINEAR16");
        assert_eq!(body["audioConfig"]["sampleRateHertz"], 16_000);
    }

    #[test]
    fn test_pitch_and_volume_mapping() {
        assert_eq!(semitones(1.0), 0.0);
        assert!(semitones(1.5) > 0.0);
        assert_eq!(gain_db(1.0), 0.0);
        assert_eq!(gain_db(0.0), -96.0);
        assert!(gain_db(0.5) < 0.0);
    }
}
