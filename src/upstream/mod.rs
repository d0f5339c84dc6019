//! Streaming transcription link.
//!
//! ```text
//! session ──submit/close──▶ LinkHandle ──▶ driver task ──▶ UpstreamTransport (WebSocket)
//!    ▲                                        │
//!    └────────────── LinkEvent ───────────────┘
//! ```

pub mod deepgram;
pub mod link;
pub mod mock;
pub mod protocol;

pub use deepgram::DeepgramConnector;
pub use link::{
    CloseOutcome, LinkConfig, LinkEvent, LinkHandle, Submit, TranscriptionConnector, UpstreamLink,
    UpstreamTransport,
};
pub use mock::{MockBackend, MockConnector, OpenGate};
pub use protocol::{BackendMessage, ControlMessage, TranscriptEvent};
