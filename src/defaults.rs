//! Default configuration constants for callrelay.
//!
//! Shared by the config layer, the CLI and the session so the same values
//! are used everywhere.

/// Default listen address for the inbound media-stream server.
pub const LISTEN_ADDR: &str = "0.0.0.0:10000";

/// Default WebSocket path the telephony provider streams to.
pub const STREAM_PATH: &str = "/ws";

/// Grace period between end-of-audio and tearing down the transcription link.
///
/// The backend can emit a final transcript shortly after it is told the
/// audio is finished; closing immediately would drop it.
pub const DRAIN_DELAY_MS: u64 = 1500;

/// Upper bound on how long the transcription link may take to open.
pub const OPEN_TIMEOUT_SECS: u64 = 10;

/// Idle interval after which a keep-alive is sent on an open link.
///
/// The listen API closes sockets that see no data for roughly ten seconds.
pub const KEEPALIVE_INTERVAL_SECS: u64 = 8;

/// High-water mark for audio held before the link opens.
///
/// Telephony media frames are 20 ms, so 500 frames is about ten seconds.
pub const PENDING_AUDIO_MAX_FRAMES: usize = 500;

/// Timeout for a single reply-generation request.
pub const REPLY_TIMEOUT_SECS: u64 = 15;

/// Capacity of the per-session inbound message channel.
pub const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// Streaming transcription endpoint.
pub const TRANSCRIPTION_URL: &str = "wss://api.deepgram.com/v1/listen";

/// Default speech recognition model.
pub const TRANSCRIPTION_MODEL: &str = "nova-3";

/// Default recognition language.
pub const TRANSCRIPTION_LANGUAGE: &str = "en-US";

/// Telephony media streams carry 8 kHz mono μ-law.
pub const AUDIO_ENCODING: &str = "mulaw";
pub const AUDIO_SAMPLE_RATE: u32 = 8000;
pub const AUDIO_CHANNELS: u32 = 1;

/// Chat-completions base URL.
pub const REPLY_BASE_URL: &str = "https://api.openai.com/v1";

/// Default reply model.
pub const REPLY_MODEL: &str = "gpt-4o";

/// System instruction sent ahead of every transcript.
pub const SYSTEM_PROMPT: &str = "You are Ava, a friendly real estate assistant.";

/// Reply used whenever generation fails.
pub const FALLBACK_REPLY: &str = "Sorry, could you repeat that?";
