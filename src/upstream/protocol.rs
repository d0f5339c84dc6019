//! JSON messages exchanged with the streaming transcription backend.
//!
//! Inbound messages are classified by their `type` field; only `Results`
//! carries transcript text. Outbound control messages share the socket with
//! binary audio frames.

use crate::error::RelayError;
use serde::{Deserialize, Serialize};

/// One recognized-text event from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEvent {
    /// Recognized text exactly as sent (may be empty or whitespace).
    pub text: String,
    /// Interim results are refined later; final ones are not.
    pub is_final: bool,
    /// Backend detected the end of an utterance.
    pub speech_final: bool,
}

impl TranscriptEvent {
    pub fn new(text: impl Into<String>, is_final: bool) -> Self {
        Self {
            text: text.into(),
            is_final,
            speech_final: false,
        }
    }

    /// True when the text has no content worth replying to.
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Classified inbound backend message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    Transcript(TranscriptEvent),
    Metadata,
    SpeechStarted,
    UtteranceEnd,
    /// Backend-reported failure; the description is free text.
    Error(String),
    /// Well-formed JSON with a type we do not handle.
    Other(String),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    msg_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResultsBody {
    channel: Option<Channel>,
    is_final: Option<bool>,
    speech_final: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    description: Option<String>,
    message: Option<String>,
}

/// Parse one text message from the backend.
///
/// Non-JSON input is a [`RelayError::Decode`]; callers log and skip it.
pub fn parse_backend_message(text: &str) -> Result<BackendMessage, RelayError> {
    let envelope: Envelope = serde_json::from_str(text).map_err(|e| RelayError::Decode {
        message: format!("backend message is not JSON: {e}"),
    })?;

    match envelope.msg_type.as_deref().unwrap_or("") {
        "Results" => {
            let body: ResultsBody = serde_json::from_str(text).map_err(|e| RelayError::Decode {
                message: format!("malformed Results message: {e}"),
            })?;
            let transcript = body
                .channel
                .and_then(|c| c.alternatives.into_iter().next())
                .map(|a| a.transcript)
                .unwrap_or_default();
            Ok(BackendMessage::Transcript(TranscriptEvent {
                text: transcript,
                // Backends without interim support omit the flag
                is_final: body.is_final.unwrap_or(true),
                speech_final: body.speech_final.unwrap_or(false),
            }))
        }
        "Metadata" => Ok(BackendMessage::Metadata),
        "SpeechStarted" => Ok(BackendMessage::SpeechStarted),
        "UtteranceEnd" => Ok(BackendMessage::UtteranceEnd),
        "Error" => {
            let description = serde_json::from_str::<ErrorBody>(text)
                .ok()
                .and_then(|b| b.description.or(b.message))
                .unwrap_or_else(|| "unknown backend error".to_string());
            Ok(BackendMessage::Error(description))
        }
        other => Ok(BackendMessage::Other(other.to_string())),
    }
}

/// Control messages sent to the backend alongside audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// No more audio; flush remaining results and close.
    CloseStream,
    /// Keep an idle connection from timing out.
    KeepAlive,
}

impl ControlMessage {
    pub fn to_json(&self) -> String {
        match self {
            ControlMessage::CloseStream => r#"{"type":"CloseStream"}"#.to_string(),
            ControlMessage::KeepAlive => r#"{"type":"KeepAlive"}"#.to_string(),
        }
    }
}

/// Build a `Results` message. Used by tests and the mock backend.
pub fn results_message(transcript: &str, is_final: bool) -> String {
    serde_json::json!({
        "type": "Results",
        "is_final": is_final,
        "speech_final": is_final,
        "channel": { "alternatives": [ { "transcript": transcript, "confidence": 0.98 } ] }
    })
    .to_string()
}
