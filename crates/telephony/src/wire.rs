//! Wire format of the TC event surface.
//!
//! Events arrive as JSON with at least `type` and `timestamp`; channel
//! events carry a `channel` object. Unknown event types parse into
//! [`TcEvent::Unknown`] so upstream additions never break the reader.

use serde::Deserialize;

use voicebridge_core::{ChannelInfo, TcEvent};

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    channel: Option<RawChannel>,
    #[serde(default)]
    playback: Option<RawPlayback>,
    #[serde(default)]
    cause: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawChannel {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    caller: RawParty,
    #[serde(default)]
    connected: RawParty,
}

#[derive(Debug, Default, Deserialize)]
struct RawParty {
    #[serde(default)]
    number: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawPlayback {
    id: String,
}

impl From<RawChannel> for ChannelInfo {
    fn from(raw: RawChannel) -> Self {
        ChannelInfo {
            id: raw.id,
            name: raw.name,
            state: raw.state,
            caller_number: raw.caller.number,
            caller_name: raw.caller.name,
            connected_number: raw.connected.number,
            connected_name: raw.connected.name,
        }
    }
}

/// Parse one TC event frame. `Err` means the frame was not valid JSON of
/// the expected envelope shape; callers drop it with a log line.
pub fn parse_event(text: &str) -> Result<TcEvent, serde_json::Error> {
    let raw: RawEvent = serde_json::from_str(text)?;

    let event = match (raw.event_type.as_str(), raw.channel, raw.playback) {
        ("StasisStart", Some(ch), _) => TcEvent::StasisStart { channel: ch.into() },
        ("ChannelStateChange", Some(ch), _) if ch.state == "Up" => {
            TcEvent::ChannelAnswered { channel: ch.into() }
        }
        ("ChannelHangupRequest", Some(ch), _) => TcEvent::ChannelHangupRequest {
            channel: ch.into(),
            cause: raw.cause,
        },
        ("ChannelDestroyed", Some(ch), _) => TcEvent::ChannelDestroyed { channel: ch.into() },
        ("StasisEnd", Some(ch), _) => TcEvent::StasisEnd { channel: ch.into() },
        ("PlaybackFinished", _, Some(pb)) => TcEvent::PlaybackFinished { playback_id: pb.id },
        ("PlaybackFailed", _, Some(pb)) => TcEvent::PlaybackFailed { playback_id: pb.id },
        (other, _, _) => TcEvent::Unknown {
            event_type: other.to_string(),
        },
    };

    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stasis_start() {
        let json = r#"{
            "type": "StasisStart",
            "timestamp": "2026-01-12T10:00:00.000+0000",
            "channel": {
                "id": "1736676000.17",
                "name": "PJSIP/trunk-00000011",
                "state": "Ring",
                "caller": {"number": "+15550100", "name": "Alice"},
                "connected": {"number": "+15550200", "name": ""}
            }
        }"#;

        match parse_event(json).unwrap() {
            TcEvent::StasisStart { channel } => {
                assert_eq!(channel.id, "1736676000.17");
                assert_eq!(channel.caller_number, "+15550100");
                assert_eq!(channel.connected_number, "+15550200");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_parse_answered_via_state_change() {
        let json = r#"{
            "type": "ChannelStateChange",
            "timestamp": "2026-01-12T10:00:01.000+0000",
            "channel": {"id": "c1", "name": "", "state": "Up",
                        "caller": {"number": "", "name": ""},
                        "connected": {"number": "", "name": ""}}
        }"#;
        assert!(matches!(
            parse_event(json).unwrap(),
            TcEvent::ChannelAnswered { .. }
        ));

        // Any other channel state is not an answer.
        let ringing = json.replace("\"Up\"", "\"Ringing\"");
        assert!(matches!(
            parse_event(&ringing).unwrap(),
            TcEvent::Unknown { .. }
        ));
    }

    #[test]
    fn test_parse_playback_finished() {
        let json = r#"{"type": "PlaybackFinished", "timestamp": "t", "playback": {"id": "pb-9"}}"#;
        match parse_event(json).unwrap() {
            TcEvent::PlaybackFinished { playback_id } => assert_eq!(playback_id, "pb-9"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_unknown_event_type_is_preserved() {
        let json = r#"{"type": "BridgeVideoSourceChanged", "timestamp": "t"}"#;
        match parse_event(json).unwrap() {
            TcEvent::Unknown { event_type } => assert_eq!(event_type, "BridgeVideoSourceChanged"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_malformed_frame_is_an_error() {
        assert!(parse_event("not json").is_err());
    }
}
