//! Whisper transcription over a request/response HTTP service.
//!
//! The upstream API is not streaming: audio is buffered until the sink
//! closes, then transcribed in one call. Tenants on this provider get
//! finals only; interim-driven features degrade accordingly.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::mpsc;

use voicebridge_core::{SpeechError, SttConfig, SttProvider, SttStream, TranscriptResult};

#[derive(Debug, Clone, Deserialize)]
pub struct WhisperConfig {
    /// Transcription endpoint, e.g. `https://api.openai.com/v1/audio/transcriptions`
    /// or a self-hosted server.
    pub endpoint: String,
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_model() -> String {
    "whisper-1".to_string()
}

pub struct WhisperStt {
    config: WhisperConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct WhisperResponse {
    text: String,
}

impl WhisperStt {
    pub fn from_config(value: &serde_json::Value) -> Result<Self, SpeechError> {
        let config: WhisperConfig = serde_json::from_value(value.clone())
            .map_err(|e| SpeechError::Configuration(format!("whisper stt: {e}")))?;
        Ok(Self {
            config,
            client: reqwest::Client::new(),
        })
    }

    async fn transcribe(
        &self,
        audio: Vec<u8>,
        language: &str,
        sample_rate: u32,
    ) -> Result<TranscriptResult, SpeechError> {
        let wav = pcm_to_wav(&audio, sample_rate);
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| SpeechError::Configuration(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.config.model.clone())
            .text("language", language.split('-').next().unwrap_or("en").to_string());

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| SpeechError::Provider(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SpeechError::Provider(format!(
                "transcription failed: HTTP {}",
                response.status()
            )));
        }
        let body: WhisperResponse = response
            .json()
            .await
            .map_err(|e| SpeechError::Protocol(e.to_string()))?;

        // The API reports no confidence; a final from it is taken at face
        // value.
        Ok(TranscriptResult::final_result(body.text, 1.0))
    }
}

#[async_trait]
impl SttProvider for WhisperStt {
    async fn open_stream(&self, config: &SttConfig) -> Result<SttStream, SpeechError> {
        let (audio_tx, mut audio_rx) = mpsc::channel::<Bytes>(32);
        let (result_tx, result_rx) = mpsc::channel(4);

        let this = WhisperStt {
            config: self.config.clone(),
            client: self.client.clone(),
        };
        let language = config.language.clone();
        let sample_rate = config.sample_rate;

        tokio::spawn(async move {
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(chunk) = audio_rx.recv().await {
                buffer.extend_from_slice(&chunk);
            }
            if buffer.is_empty() {
                return;
            }
            let result = this.transcribe(buffer, &language, sample_rate).await;
            let _ = result_tx.send(result).await;
        });

        Ok(SttStream {
            audio: audio_tx,
            results: result_rx,
        })
    }

    fn name(&self) -> &'static str {
        "whisper"
    }
}

/// Wrap raw 16-bit mono PCM in a minimal WAV container.
fn pcm_to_wav(pcm: &[u8], sample_rate: u32) -> Vec<u8> {
    let data_len = pcm.len() as u32;
    let byte_rate = sample_rate * 2;
    let mut wav = Vec::with_capacity(44 + pcm.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&1u16.to_le_bytes()); // mono
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&2u16.to_le_bytes()); // block align
    wav.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm);
    wav
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wav_header() {
        let pcm = vec![0u8; 3200];
        let wav = pcm_to_wav(&pcm, 16_000);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + 3200);
        assert_eq!(
            u32::from_le_bytes(wav[24..28].try_into().unwrap()),
            16_000
        );
    }

    #[tokio::test]
    async fn test_empty_input_produces_no_result() {
        let provider = WhisperStt::from_config(&serde_json::json!({
            "endpoint": "http://localhost:9000/v1/audio/transcriptions",
            "api_key": "k"
        }))
        .unwrap();
        let mut stream = provider.open_stream(&SttConfig::default()).await.unwrap();
        drop(stream.audio);
        assert!(stream.results.recv().await.is_none());
    }
}
