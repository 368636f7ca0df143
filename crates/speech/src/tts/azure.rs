//! Azure cognitive-services synthesis: SSML in, raw audio body out.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::mpsc;

use voicebridge_core::{AudioEncoding, SpeechError, TtsConfig, TtsProvider};

#[derive(Debug, Clone, Deserialize)]
pub struct AzureTtsConfig {
    pub region: String,
    pub subscription_key: String,
}

pub struct AzureTts {
    config: AzureTtsConfig,
    client: reqwest::Client,
}

fn output_format(encoding: AudioEncoding, sample_rate: u32) -> Result<&'static str, SpeechError> {
    match (encoding, sample_rate) {
        (AudioEncoding::Pcm, 8_000) => Ok("raw-8khz-16bit-mono-pcm"),
        (AudioEncoding::Pcm, 16_000) => Ok("raw-16khz-16bit-mono-pcm"),
        (AudioEncoding::Pcm, 24_000) => Ok("raw-24khz-16bit-mono-pcm"),
        (AudioEncoding::Wav, 16_000) => Ok("riff-16khz-16bit-mono-pcm"),
        (AudioEncoding::Mp3, _) => Ok("audio-16khz-128kbitrate-mono-mp3"),
        (AudioEncoding::Opus, _) => Ok("ogg-16khz-16bit-mono-opus"),
        (encoding, rate) => Err(SpeechError::Configuration(format!(
            "unsupported azure output: {} at {rate} Hz",
            encoding.as_str()
        ))),
    }
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn build_ssml(text: &str, config: &TtsConfig) -> String {
    format!(
        "<speak version='1.0' xml:lang='{lang}'>\
         <voice name='{voice}'>\
         <prosody rate='{rate:.2}' pitch='{pitch:+.0}%' volume='{volume:.0}'>{text}</prosody>\
         </voice></speak>",
        lang = config.language,
        voice = config.voice_id,
        rate = config.rate,
        pitch = (config.pitch - 1.0) * 50.0,
        volume = (config.volume * 100.0).clamp(0.0, 100.0),
        text = escape_xml(text),
    )
}

impl AzureTts {
    pub fn from_config(value: &serde_json::Value) -> Result<Self, SpeechError> {
        let config: AzureTtsConfig = serde_json::from_value(value.clone())
            .map_err(|e| SpeechError::Configuration(format!("azure tts: {e}")))?;
        Ok(Self {
            config,
            client: reqwest::Client::new(),
        })
    }

    async fn request(
        &self,
        text: &str,
        config: &TtsConfig,
    ) -> Result<reqwest::Response, SpeechError> {
        let url = format!(
            "https://{}.tts.speech.microsoft.com/cognitiveservices/v1",
            self.config.region
        );
        let response = self
            .client
            .post(&url)
            .header("Ocp-Apim-Subscription-Key", &self.config.subscription_key)
            .header("Content-Type", "application/ssml+xml")
            .header(
                "X-Microsoft-OutputFormat",
                output_format(config.encoding, config.sample_rate)?,
            )
            .body(build_ssml(text, config))
            .send()
            .await
            .map_err(|e| SpeechError::Provider(e.to_string()))?;
        super::check_synthesis_response(response).await
    }
}

#[async_trait]
impl TtsProvider for AzureTts {
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
        "azure"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssml_escapes_text() {
        let config = TtsConfig {
            language: "en-US".into(),
            voice_id: "en-US-JennyNeural".into(),
            ..TtsConfig::default()
        };
        let ssml = build_ssml("a < b & c", &config);
        assert!(ssml.contains("a &lt; b &amp; c"));
        assert!(ssml.contains("en-US-JennyNeural"));
    }

    #[test]
    fn test_output_format_selection() {
        assert_eq!(
            output_format(AudioEncoding::Pcm, 16_000).unwrap(),
            "raw-16khz-16bit-mono-pcm"
        );
        assert!(output_format(AudioEncoding::Pcm, 44_100).is_err());
    }
}
