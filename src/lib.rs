//! callrelay - live call audio to transcription and replies
//!
//! Accepts telephony media streams over WebSocket, relays the audio to a
//! streaming speech-to-text backend and turns each recognized utterance into
//! a generated reply.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod app;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod defaults;
pub mod error;
pub mod reply;
pub mod server;
pub mod session;
pub mod stream;
pub mod upstream;

// Core seams (transport → session → reply)
pub use reply::{ReplyGenerator, ReplySink};
pub use upstream::{TranscriptionConnector, UpstreamTransport};

// Session
pub use session::{CallSession, SessionServices, SessionState, SessionSummary};
pub use server::RelayServer;

// Error handling
pub use error::{RelayError, Result};

// Config
pub use config::{Config, ReplyPolicy};

/// Crate version, suffixed with `+<short hash>` when built from a git checkout.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{version}+{hash}"),
        _ => version.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_string_matches_build_metadata() {
        let ver = version_string();
        assert!(ver.starts_with(env!("CARGO_PKG_VERSION")));
        match option_env!("GIT_HASH").filter(|h| !h.is_empty()) {
            Some(hash) => assert!(ver.ends_with(&format!("+{hash}")), "got {ver}"),
            None => assert_eq!(ver, env!("CARGO_PKG_VERSION")),
        }
    }
}
