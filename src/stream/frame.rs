//! Frame decoder for the inbound telephony media stream.
//!
//! Every message on the inbound socket is a JSON envelope with an `event`
//! discriminant:
//!
//! ```text
//! {"event":"start","start":{"callSid":"CA…","streamSid":"MZ…"}}
//! {"event":"media","media":{"payload":"<base64 audio>"}}
//! {"event":"stop"}
//! ```
//!
//! Unknown events are ignored so new provider events never break a call.

use crate::error::RelayError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;

/// One decoded unit of inbound audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Arrival order within the call, starting at 0.
    pub sequence: u64,
    /// Raw audio bytes, encoding as negotiated with the backend.
    pub payload: Vec<u8>,
}

impl AudioFrame {
    pub fn new(sequence: u64, payload: Vec<u8>) -> Self {
        Self { sequence, payload }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Result of decoding one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// Stream started for a call.
    Start {
        call_sid: String,
        stream_sid: Option<String>,
    },
    /// Audio payload.
    Media(AudioFrame),
    /// A media event whose payload decoded to zero bytes.
    EmptyPayload,
    /// End of the media stream.
    Stop,
    /// Any other event name; carries the name for logging.
    Ignored(String),
}

impl InboundEvent {
    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::Start { .. } => "start",
            InboundEvent::Media(_) => "media",
            InboundEvent::EmptyPayload => "empty_payload",
            InboundEvent::Stop => "stop",
            InboundEvent::Ignored(_) => "ignored",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    event: Option<String>,
    stream_sid: Option<String>,
    start: Option<StartBody>,
    media: Option<MediaBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartBody {
    call_sid: Option<String>,
    stream_sid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MediaBody {
    payload: Option<String>,
}

/// Stateful decoder: owns the per-call frame sequence counter.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    next_sequence: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of audio frames decoded so far.
    pub fn frames_decoded(&self) -> u64 {
        self.next_sequence
    }

    /// Decode one raw inbound message.
    ///
    /// Malformed input yields [`RelayError::Decode`]; the caller logs it and
    /// carries on with the next message.
    pub fn decode(&mut self, raw: &str) -> Result<InboundEvent, RelayError> {
        let envelope: Envelope = serde_json::from_str(raw).map_err(|e| RelayError::Decode {
            message: e.to_string(),
        })?;

        let event = envelope.event.ok_or_else(|| RelayError::Decode {
            message: "missing `event` field".to_string(),
        })?;

        match event.as_str() {
            "start" => {
                let start = envelope.start.ok_or_else(|| RelayError::Decode {
                    message: "start event without `start` body".to_string(),
                })?;
                let call_sid = start.call_sid.ok_or_else(|| RelayError::Decode {
                    message: "start event without `callSid`".to_string(),
                })?;
                Ok(InboundEvent::Start {
                    call_sid,
                    stream_sid: start.stream_sid.or(envelope.stream_sid),
                })
            }
            "media" => {
                let payload = envelope
                    .media
                    .and_then(|m| m.payload)
                    .ok_or_else(|| RelayError::Decode {
                        message: "media event without `payload`".to_string(),
                    })?;
                let bytes = STANDARD
                    .decode(payload.as_bytes())
                    .map_err(|e| RelayError::Decode {
                        message: format!("invalid base64 payload: {e}"),
                    })?;
                if bytes.is_empty() {
                    return Ok(InboundEvent::EmptyPayload);
                }
                let frame = AudioFrame::new(self.next_sequence, bytes);
                self.next_sequence += 1;
                Ok(InboundEvent::Media(frame))
            }
            "stop" => Ok(InboundEvent::Stop),
            _ => Ok(InboundEvent::Ignored(event)),
        }
    }
}

/// Build a media envelope. Used by tests and the replay tool.
pub fn media_message(payload: &[u8]) -> String {
    serde_json::json!({
        "event": "media",
        "media": { "payload": STANDARD.encode(payload) }
    })
    .to_string()
}

/// Build a start envelope for the given call.
pub fn start_message(call_sid: &str) -> String {
    serde_json::json!({
        "event": "start",
        "start": { "callSid": call_sid }
    })
    .to_string()
}

/// Build a stop envelope.
pub fn stop_message() -> String {
    r#"{"event":"stop"}"#.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_start_event() {
        let mut decoder = FrameDecoder::new();
        let event = decoder
            .decode(r#"{"event":"start","start":{"callSid":"CA123","streamSid":"MZ9"}}"#)
            .unwrap();

        assert_eq!(
            event,
            InboundEvent::Start {
                call_sid: "CA123".to_string(),
                stream_sid: Some("MZ9".to_string()),
            }
        );
    }

    #[test]
    fn test_decode_start_takes_top_level_stream_sid() {
        let mut decoder = FrameDecoder::new();
        let event = decoder
            .decode(r#"{"event":"start","streamSid":"MZ1","start":{"callSid":"CA1"}}"#)
            .unwrap();

        assert_eq!(
            event,
            InboundEvent::Start {
                call_sid: "CA1".to_string(),
                stream_sid: Some("MZ1".to_string()),
            }
        );
    }

    #[test]
    fn test_decode_start_without_call_sid_is_error() {
        let mut decoder = FrameDecoder::new();
        let result = decoder.decode(r#"{"event":"start","start":{}}"#);
        assert!(matches!(result, Err(RelayError::Decode { .. })));
    }

    #[test]
    fn test_decode_media_event() {
        let mut decoder = FrameDecoder::new();
        let event = decoder.decode(&media_message(&[0xff, 0x7f, 0x00])).unwrap();

        match event {
            InboundEvent::Media(frame) => {
                assert_eq!(frame.sequence, 0);
                assert_eq!(frame.payload, vec![0xff, 0x7f, 0x00]);
            }
            other => panic!("Expected Media, got {:?}", other),
        }
    }

    #[test]
    fn test_media_frames_are_numbered_in_arrival_order() {
        let mut decoder = FrameDecoder::new();
        let mut sequences = Vec::new();
        for byte in 1u8..=3 {
            if let InboundEvent::Media(frame) = decoder.decode(&media_message(&[byte])).unwrap() {
                sequences.push(frame.sequence);
            }
        }

        assert_eq!(sequences, vec![0, 1, 2]);
        assert_eq!(decoder.frames_decoded(), 3);
    }

    #[test]
    fn test_empty_payload_is_not_an_error() {
        let mut decoder = FrameDecoder::new();
        let event = decoder
            .decode(r#"{"event":"media","media":{"payload":""}}"#)
            .unwrap();

        assert_eq!(event, InboundEvent::EmptyPayload);
        // Empty payloads do not consume a sequence number
        assert_eq!(decoder.frames_decoded(), 0);
    }

    #[test]
    fn test_media_without_payload_is_error() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.decode(r#"{"event":"media","media":{}}"#).is_err());
        assert!(decoder.decode(r#"{"event":"media"}"#).is_err());
    }

    #[test]
    fn test_invalid_base64_is_error() {
        let mut decoder = FrameDecoder::new();
        let result = decoder.decode(r#"{"event":"media","media":{"payload":"!!not base64!!"}}"#);
        assert!(matches!(result, Err(RelayError::Decode { .. })));
    }

    #[test]
    fn test_decode_stop_event() {
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.decode(&stop_message()).unwrap(), InboundEvent::Stop);
    }

    #[test]
    fn test_unknown_event_is_ignored() {
        let mut decoder = FrameDecoder::new();
        let event = decoder
            .decode(r#"{"event":"mark","mark":{"name":"x"}}"#)
            .unwrap();
        assert_eq!(event, InboundEvent::Ignored("mark".to_string()));

        let event = decoder.decode(r#"{"event":"connected"}"#).unwrap();
        assert_eq!(event.kind(), "ignored");
    }

    #[test]
    fn test_malformed_input_is_error() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.decode("not json at all").is_err());
        assert!(decoder.decode(r#"{"no_event":true}"#).is_err());
        assert!(decoder.decode("").is_err());
    }

    #[test]
    fn test_start_message_helper_roundtrips() {
        let mut decoder = FrameDecoder::new();
        match decoder.decode(&start_message("CA42")).unwrap() {
            InboundEvent::Start { call_sid, .. } => assert_eq!(call_sid, "CA42"),
            other => panic!("Expected Start, got {:?}", other),
        }
    }
}
