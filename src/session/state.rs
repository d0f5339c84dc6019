use std::fmt;

/// Lifecycle of one call.
///
/// ```text
/// Initializing ──link opened──▶ Streaming ──stop / inbound closed / link failed──▶ Draining ──link closed──▶ Closed
///       └──────────────────── stop / inbound closed / link failed ─────────────────────▲
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Link requested, audio is buffered.
    #[default]
    Initializing,
    /// Link open, audio forwarded as it arrives.
    Streaming,
    /// No more audio accepted; trailing transcripts still handled.
    Draining,
    /// Nothing further happens for this call.
    Closed,
}

impl SessionState {
    /// Whether inbound audio may still reach the link.
    pub fn accepts_audio(self) -> bool {
        matches!(self, SessionState::Initializing | SessionState::Streaming)
    }

    /// Whether the session has already started winding down.
    pub fn is_ending(self) -> bool {
        matches!(self, SessionState::Draining | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Initializing => "initializing",
            SessionState::Streaming => "streaming",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        })
    }
}

/// The session's view of its transcription link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// Connection attempt in flight.
    #[default]
    Pending,
    Open,
    /// Close requested, drain in progress.
    Closing,
    Closed,
    /// Failed; a `Closed` notification is still to come.
    Error,
}

impl LinkState {
    /// Whether audio can be submitted directly.
    pub fn accepts_audio(self) -> bool {
        self == LinkState::Open
    }

    /// Whether asking the link to close still makes sense.
    pub fn can_close(self) -> bool {
        matches!(self, LinkState::Pending | LinkState::Open)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LinkState::Pending => "pending",
            LinkState::Open => "open",
            LinkState::Closing => "closing",
            LinkState::Closed => "closed",
            LinkState::Error => "error",
        })
    }
}
