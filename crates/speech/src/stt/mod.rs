//! Streaming speech-to-text providers.

mod aws;
mod azure;
mod google;
mod whisper;

use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

use voicebridge_core::{SpeechError, SttProvider, SttStream, TranscriptResult};

pub use aws::AwsTranscribeStt;
pub use azure::AzureStt;
pub use google::GoogleStt;
pub use whisper::WhisperStt;

/// Build an STT provider by name. Unknown names are a configuration error,
/// surfaced before any call is admitted for the tenant.
pub fn create_stt_provider(
    name: &str,
    provider_config: &serde_json::Value,
) -> Result<Arc<dyn SttProvider>, SpeechError> {
    match name {
        "google" => Ok(Arc::new(GoogleStt::from_config(provider_config)?)),
        "azure" => Ok(Arc::new(AzureStt::from_config(provider_config)?)),
        "aws" => Ok(Arc::new(AwsTranscribeStt::from_config(provider_config)?)),
        "whisper" => Ok(Arc::new(WhisperStt::from_config(provider_config)?)),
        other => Err(SpeechError::UnknownProvider(other.to_string())),
    }
}

/// How a provider's wire messages map onto the shared stream shape.
pub(crate) trait WsDialect: Send + Sync + 'static {
    /// First frame sent after connect, configuring the recognition stream.
    fn open_frame(&self) -> Option<String>;

    /// Frame sent after the audio sink closes, where the provider expects an
    /// explicit end-of-input marker.
    fn close_frame(&self) -> Option<String>;

    /// Map one text frame to a result. `None` for frames that carry no
    /// transcript (acks, lattice metadata).
    fn parse_frame(&self, text: &str) -> Option<Result<TranscriptResult, SpeechError>>;
}

/// Open a provider WebSocket and pump it: audio chunks out as binary
/// frames, transcripts in through the result channel, in arrival order.
/// Writer and reader run as separate tasks so interim results flow while
/// audio is still being fed.
///
/// The result channel terminates when the provider closes the stream after
/// end-of-input, or on socket error, in which case the final item carries
/// the error.
pub(crate) async fn open_ws_stream<D: WsDialect>(
    url: &str,
    headers: &[(&'static str, String)],
    dialect: D,
) -> Result<SttStream, SpeechError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| SpeechError::Configuration(e.to_string()))?;
    for (name, value) in headers {
        request.headers_mut().insert(
            *name,
            value
                .parse()
                .map_err(|_| SpeechError::Configuration(format!("bad header {name}")))?,
        );
    }

    let (socket, _) = connect_async(request)
        .await
        .map_err(|e| SpeechError::Provider(e.to_string()))?;
    let (mut write, mut read) = socket.split();

    let dialect = Arc::new(dialect);

    if let Some(open) = dialect.open_frame() {
        write
            .send(Message::Text(open))
            .await
            .map_err(|e| SpeechError::Stream(e.to_string()))?;
    }

    let (audio_tx, mut audio_rx) = mpsc::channel::<Bytes>(32);
    let (result_tx, result_rx) = mpsc::channel::<Result<TranscriptResult, SpeechError>>(32);

    // Writer: forward audio until the sink closes, then mark end-of-input.
    let writer_dialect = dialect.clone();
    tokio::spawn(async move {
        while let Some(chunk) = audio_rx.recv().await {
            if let Err(e) = write.send(Message::Binary(chunk.to_vec())).await {
                tracing::warn!(error = %e, "STT audio write failed");
                return;
            }
        }
        if let Some(close) = writer_dialect.close_frame() {
            let _ = write.send(Message::Text(close)).await;
        }
        let _ = write.send(Message::Close(None)).await;
    });

    // Reader: parse frames into ordered results until the stream ends.
    tokio::spawn(async move {
        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    if let Some(result) = dialect.parse_frame(&text) {
                        if result_tx.send(result).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(Message::Close(_)) => return,
                Ok(_) => {}
                Err(e) => {
                    let _ = result_tx
                        .send(Err(SpeechError::Stream(e.to_string())))
                        .await;
                    return;
                }
            }
        }
    });

    Ok(SttStream {
        audio: audio_tx,
        results: result_rx,
    })
}
