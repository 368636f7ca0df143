//! Seam to the telephony control plane: the request surface every session
//! uses, and the typed event stream its WebSocket reader produces.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::TelephonyError;
use crate::speech::AudioEncoding;

/// Opaque handle for an in-flight playback, usable for cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackHandle(pub String);

/// What to play into a channel.
#[derive(Debug, Clone)]
pub enum PlaybackSource {
    /// A media URI the TC already knows how to resolve (`sound:...`,
    /// `http:...`).
    MediaUri(String),
    /// Raw synthesized audio handed to the TC's media-accepting playback
    /// endpoint.
    Audio {
        data: Bytes,
        encoding: AudioEncoding,
        sample_rate: u32,
    },
}

/// Hangup cause forwarded to the TC where it supports one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HangupReason {
    Normal,
    Busy,
    Congestion,
}

impl HangupReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            HangupReason::Normal => "normal",
            HangupReason::Busy => "busy",
            HangupReason::Congestion => "congestion",
        }
    }
}

/// Channel facts as reported by the TC.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub caller_number: String,
    #[serde(default)]
    pub caller_name: String,
    #[serde(default)]
    pub connected_number: String,
    #[serde(default)]
    pub connected_name: String,
}

/// Typed events read from the TC event socket. `Unknown` preserves forward
/// compatibility: new upstream event types are ignored, not fatal.
#[derive(Debug, Clone)]
pub enum TcEvent {
    /// A channel entered the application.
    StasisStart { channel: ChannelInfo },
    ChannelAnswered { channel: ChannelInfo },
    ChannelHangupRequest { channel: ChannelInfo, cause: Option<i64> },
    ChannelDestroyed { channel: ChannelInfo },
    StasisEnd { channel: ChannelInfo },
    PlaybackFinished { playback_id: String },
    PlaybackFailed { playback_id: String },
    /// Synthesized locally after a reconnect for channels the TC no longer
    /// knows about. Never arrives on the wire.
    ChannelLost { channel_id: String },
    Unknown { event_type: String },
}

impl TcEvent {
    /// Channel id this event concerns, if any; used to route the event to
    /// the owning session task.
    pub fn channel_id(&self) -> Option<&str> {
        match self {
            TcEvent::StasisStart { channel }
            | TcEvent::ChannelAnswered { channel }
            | TcEvent::ChannelHangupRequest { channel, .. }
            | TcEvent::ChannelDestroyed { channel }
            | TcEvent::StasisEnd { channel } => Some(&channel.id),
            TcEvent::ChannelLost { channel_id } => Some(channel_id),
            TcEvent::PlaybackFinished { .. }
            | TcEvent::PlaybackFailed { .. }
            | TcEvent::Unknown { .. } => None,
        }
    }
}

/// Request surface of the telephony control plane.
///
/// Implementations must be safe for concurrent use; every method carries its
/// own deadline. Requests are duplicate-safe on the TC side (`answer` on an
/// already-answered channel succeeds silently).
#[async_trait]
pub trait TelephonyClient: Send + Sync {
    async fn answer(&self, channel_id: &str) -> Result<(), TelephonyError>;

    /// Start playback on a channel, returning a handle usable with
    /// [`stop_playback`](Self::stop_playback).
    async fn play(
        &self,
        channel_id: &str,
        source: PlaybackSource,
    ) -> Result<PlaybackHandle, TelephonyError>;

    /// Cancel an in-flight playback. Used for barge-in; stopping an
    /// already-finished playback is not an error.
    async fn stop_playback(&self, handle: &PlaybackHandle) -> Result<(), TelephonyError>;

    async fn hangup(
        &self,
        channel_id: &str,
        reason: Option<HangupReason>,
    ) -> Result<(), TelephonyError>;

    /// Create a mixing bridge for a warm transfer; returns the bridge id.
    async fn create_bridge(&self, kind: &str) -> Result<String, TelephonyError>;

    async fn add_to_bridge(&self, bridge_id: &str, channel_id: &str)
        -> Result<(), TelephonyError>;

    /// Dial out to an endpoint, returning the new channel id.
    async fn originate(&self, endpoint: &str, caller_id: &str) -> Result<String, TelephonyError>;

    /// Fetch channel facts; `Ok(None)` means the TC no longer knows the
    /// channel. Used for state recovery after reconnect.
    async fn channel_info(&self, channel_id: &str)
        -> Result<Option<ChannelInfo>, TelephonyError>;
}
