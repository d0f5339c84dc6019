//! Error types for callrelay.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Inbound media stream errors
    #[error("Malformed inbound message: {message}")]
    Decode { message: String },

    // Upstream transcription link errors
    #[error("Transcription link failed to open: {message}")]
    LinkOpen { message: String },

    #[error("Transcription link error: {message}")]
    LinkRuntime { message: String },

    // Reply generation errors
    #[error("Reply generation failed: {message}")]
    Generator { message: String },

    // Transport errors
    #[error("WebSocket error: {message}")]
    WebSocket { message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for RelayError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        RelayError::WebSocket {
            message: e.to_string(),
        }
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, RelayError>;
