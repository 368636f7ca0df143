//! Speech provider seams: streaming STT in, synthesized audio out.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::SpeechError;

/// Audio container/codec understood across the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioEncoding {
    #[default]
    Pcm,
    Mp3,
    Opus,
    Wav,
}

impl AudioEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioEncoding::Pcm => "pcm",
            AudioEncoding::Mp3 => "mp3",
            AudioEncoding::Opus => "opus",
            AudioEncoding::Wav => "wav",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            AudioEncoding::Pcm => "audio/l16",
            AudioEncoding::Mp3 => "audio/mpeg",
            AudioEncoding::Opus => "audio/opus",
            AudioEncoding::Wav => "audio/wav",
        }
    }
}

/// Configuration for one STT stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    pub language: String,
    pub sample_rate: u32,
    pub encoding: AudioEncoding,
    /// Deliver interim hypotheses before each final.
    pub interim_results: bool,
    /// Close the stream after the first final result.
    pub single_utterance: bool,
    /// Provider-specific settings, passed through opaquely.
    #[serde(default)]
    pub provider_config: serde_json::Value,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            language: "en-US".to_string(),
            sample_rate: 16_000,
            encoding: AudioEncoding::Pcm,
            interim_results: true,
            single_utterance: false,
            provider_config: serde_json::Value::Null,
        }
    }
}

/// One recognition result, interim or final.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptResult {
    pub text: String,
    /// In `[0, 1]`.
    pub confidence: f32,
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternatives: Vec<String>,
}

impl TranscriptResult {
    pub fn interim(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
            is_final: false,
            alternatives: Vec::new(),
        }
    }

    pub fn final_result(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
            is_final: true,
            alternatives: Vec::new(),
        }
    }
}

/// An open bidirectional recognition stream.
///
/// PCM chunks go into `audio`; dropping the sender signals end-of-input.
/// `results` yields transcripts in submission order and terminates when the
/// sink closes or on provider error, in which case the last item carries the
/// error.
pub struct SttStream {
    pub audio: mpsc::Sender<Bytes>,
    pub results: mpsc::Receiver<Result<TranscriptResult, SpeechError>>,
}

/// Streaming speech-to-text provider, selected by name per tenant.
#[async_trait]
pub trait SttProvider: Send + Sync {
    async fn open_stream(&self, config: &SttConfig) -> Result<SttStream, SpeechError>;

    fn name(&self) -> &'static str;
}

/// Configuration for one synthesis request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    pub language: String,
    pub voice_id: String,
    /// Speaking rate, `1.0` = provider default.
    pub rate: f32,
    /// Pitch shift, `1.0` = provider default.
    pub pitch: f32,
    /// Volume gain, `1.0` = provider default.
    pub volume: f32,
    pub sample_rate: u32,
    pub encoding: AudioEncoding,
    #[serde(default)]
    pub provider_config: serde_json::Value,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            language: "en-US".to_string(),
            voice_id: String::new(),
            rate: 1.0,
            pitch: 1.0,
            volume: 1.0,
            sample_rate: 16_000,
            encoding: AudioEncoding::Pcm,
            provider_config: serde_json::Value::Null,
        }
    }
}

/// Text-to-speech provider, selected by name per tenant.
///
/// Dropping the receiver returned by `synthesize_stream` cancels any ongoing
/// remote call; the orchestrator relies on this for barge-in.
#[async_trait]
pub trait TtsProvider: Send + Sync {
    /// Synthesize a whole utterance.
    async fn synthesize(&self, text: &str, config: &TtsConfig) -> Result<Bytes, SpeechError>;

    /// Synthesize an utterance as a cancellable chunk stream.
    async fn synthesize_stream(
        &self,
        text: &str,
        config: &TtsConfig,
    ) -> Result<mpsc::Receiver<Result<Bytes, SpeechError>>, SpeechError>;

    fn name(&self) -> &'static str;
}
