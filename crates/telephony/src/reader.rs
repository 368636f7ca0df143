//! Durable event WebSocket reader.
//!
//! One dedicated task owns the connection and walks the state machine
//! `disconnected -> connecting -> reading -> backoff -> connecting ...`.
//! Backoff is exponential with jitter and a cap; the attempt counter resets
//! on any successful read. After every reconnect the reader resyncs: it asks
//! the TC about each channel the orchestrator still believes is live and
//! emits a synthetic `ChannelLost` for the ones the TC no longer knows.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use voicebridge_core::{TcEvent, TelephonyClient, TelephonyError};

use crate::wire::parse_event;

/// Connection state, observable for readiness checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Reading,
    Backoff,
}

/// Source of channels the orchestrator currently owns; consulted during
/// post-reconnect resync.
#[async_trait]
pub trait LiveChannels: Send + Sync {
    async fn live_channels(&self) -> Vec<String>;
}

/// What the reader feeds downstream.
#[derive(Debug)]
pub enum TcFeed {
    Event(TcEvent),
    /// The reader exhausted its reconnect budget and stopped.
    Fatal(TelephonyError),
}

#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Full WS URL including the application query parameter.
    pub ws_url: String,
    pub username: String,
    pub password: String,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Consecutive failed connects tolerated before giving up; `0` means
    /// reconnect forever.
    pub max_reconnects: u32,
}

/// Handle to the spawned reader task.
pub struct EventReader {
    state_rx: watch::Receiver<ConnectionState>,
}

impl EventReader {
    /// Spawn the reader. Returns the handle and the event feed; the feed
    /// closes after a fatal error or when the receiver side is dropped.
    pub fn spawn(
        config: ReaderConfig,
        telephony: Arc<dyn TelephonyClient>,
        live: Arc<dyn LiveChannels>,
    ) -> (Self, mpsc::Receiver<TcFeed>) {
        let (feed_tx, feed_rx) = mpsc::channel(256);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        tokio::spawn(read_loop(config, telephony, live, feed_tx, state_tx));

        (Self { state_rx }, feed_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Reading
    }
}

/// Exponential backoff with jitter: `initial * 2^attempt`, capped, plus up
/// to 20% random spread.
fn backoff_delay(config: &ReaderConfig, attempt: u32) -> Duration {
    let exp = config
        .backoff_initial
        .saturating_mul(1u32 << attempt.min(16));
    let capped = exp.min(config.backoff_max);
    let jitter = rand::thread_rng().gen_range(0.0..0.2);
    capped.mul_f64(1.0 + jitter)
}

fn ws_url_with_auth(config: &ReaderConfig) -> String {
    let sep = if config.ws_url.contains('?') { '&' } else { '?' };
    format!(
        "{}{}api_key={}:{}",
        config.ws_url, sep, config.username, config.password
    )
}

async fn read_loop(
    config: ReaderConfig,
    telephony: Arc<dyn TelephonyClient>,
    live: Arc<dyn LiveChannels>,
    feed_tx: mpsc::Sender<TcFeed>,
    state_tx: watch::Sender<ConnectionState>,
) {
    let url = ws_url_with_auth(&config);
    let mut failed_connects: u32 = 0;
    let mut first_connect = true;

    loop {
        let _ = state_tx.send(ConnectionState::Connecting);

        let stream = match connect_async(url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                failed_connects += 1;
                metrics::counter!("tc_ws_reconnects_total").increment(1);
                tracing::warn!(
                    attempt = failed_connects,
                    error = %e,
                    "TC event socket connect failed"
                );
                if config.max_reconnects > 0 && failed_connects >= config.max_reconnects {
                    tracing::error!(
                        attempts = failed_connects,
                        "TC event socket unrecoverable, surrendering"
                    );
                    let _ = feed_tx
                        .send(TcFeed::Fatal(TelephonyError::MaxReconnects(
                            failed_connects,
                        )))
                        .await;
                    let _ = state_tx.send(ConnectionState::Disconnected);
                    return;
                }
                let _ = state_tx.send(ConnectionState::Backoff);
                tokio::time::sleep(backoff_delay(&config, failed_connects)).await;
                continue;
            }
        };

        tracing::info!(reconnect = !first_connect, "TC event socket connected");
        let _ = state_tx.send(ConnectionState::Reading);

        // Resync survivors. Joining the application happened via the URL;
        // this is the only place recovery occurs.
        if !first_connect {
            resync(&telephony, &live, &feed_tx).await;
        }
        first_connect = false;

        let (_, mut read) = stream.split();
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    // A successful read proves the link; reset the budget.
                    failed_connects = 0;
                    match parse_event(&text) {
                        Ok(event) => {
                            if feed_tx.send(TcFeed::Event(event)).await.is_err() {
                                // Downstream gone: orderly shutdown.
                                let _ = state_tx.send(ConnectionState::Disconnected);
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, frame = %text, "dropping malformed TC event");
                        }
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    tracing::warn!("TC event socket closed");
                    break;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => {
                    // Read errors are never retried in place; unwind to the
                    // reconnect loop.
                    tracing::warn!(error = %e, "TC event socket read error");
                    break;
                }
            }
        }

        failed_connects += 1;
        metrics::counter!("tc_ws_reconnects_total").increment(1);
        let _ = state_tx.send(ConnectionState::Backoff);
        tokio::time::sleep(backoff_delay(&config, failed_connects)).await;
    }
}

/// Ask the TC about every channel the orchestrator believes is live and
/// synthesize `ChannelLost` for the ones it no longer knows.
async fn resync(
    telephony: &Arc<dyn TelephonyClient>,
    live: &Arc<dyn LiveChannels>,
    feed_tx: &mpsc::Sender<TcFeed>,
) {
    let channels = live.live_channels().await;
    if channels.is_empty() {
        return;
    }
    tracing::info!(count = channels.len(), "resyncing channels after reconnect");

    for channel_id in channels {
        match telephony.channel_info(&channel_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::warn!(channel_id = %channel_id, "channel vanished during disconnect");
                let _ = feed_tx
                    .send(TcFeed::Event(TcEvent::ChannelLost { channel_id }))
                    .await;
            }
            Err(e) => {
                // Leave the channel alone; the next reconnect retries.
                tracing::warn!(channel_id = %channel_id, error = %e, "resync probe failed");
            }
        }
    }
}
