use crate::defaults;
use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub transcription: TranscriptionConfig,
    pub reply: ReplyConfig,
    pub session: SessionConfig,
}

/// Inbound media-stream server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub path: String,
}

/// Streaming speech-to-text configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TranscriptionConfig {
    pub api_key: Option<String>,
    pub url: String,
    pub model: String,
    pub language: String,
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u32,
    pub punctuate: bool,
    pub smart_format: bool,
    pub interim_results: bool,
    #[serde(with = "humantime_duration")]
    pub open_timeout: Duration,
    #[serde(with = "humantime_duration")]
    pub keepalive_interval: Duration,
}

/// Reply generation configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReplyConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub system_prompt: String,
    pub fallback: String,
    #[serde(with = "humantime_duration")]
    pub timeout: Duration,
}

/// Per-call session configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(with = "humantime_duration")]
    pub drain_delay: Duration,
    pub pending_audio_max_frames: usize,
    pub reply_policy: ReplyPolicy,
}

/// Which transcript results trigger a reply
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReplyPolicy {
    /// Only results the backend marks final.
    #[default]
    Final,
    /// Interim and final results alike.
    All,
}

impl ReplyPolicy {
    /// Whether a transcript with the given finality should get a reply.
    pub fn accepts(self, is_final: bool) -> bool {
        match self {
            ReplyPolicy::Final => is_final,
            ReplyPolicy::All => true,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: defaults::LISTEN_ADDR.to_string(),
            path: defaults::STREAM_PATH.to_string(),
        }
    }
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            url: defaults::TRANSCRIPTION_URL.to_string(),
            model: defaults::TRANSCRIPTION_MODEL.to_string(),
            language: defaults::TRANSCRIPTION_LANGUAGE.to_string(),
            encoding: defaults::AUDIO_ENCODING.to_string(),
            sample_rate: defaults::AUDIO_SAMPLE_RATE,
            channels: defaults::AUDIO_CHANNELS,
            punctuate: true,
            smart_format: true,
            interim_results: true,
            open_timeout: Duration::from_secs(defaults::OPEN_TIMEOUT_SECS),
            keepalive_interval: Duration::from_secs(defaults::KEEPALIVE_INTERVAL_SECS),
        }
    }
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: defaults::REPLY_BASE_URL.to_string(),
            model: defaults::REPLY_MODEL.to_string(),
            temperature: None,
            system_prompt: defaults::SYSTEM_PROMPT.to_string(),
            fallback: defaults::FALLBACK_REPLY.to_string(),
            timeout: Duration::from_secs(defaults::REPLY_TIMEOUT_SECS),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            drain_delay: Duration::from_millis(defaults::DRAIN_DELAY_MS),
            pending_audio_max_frames: defaults::PENDING_AUDIO_MAX_FRAMES,
            reply_policy: ReplyPolicy::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only returns defaults if the file is missing.
    /// Returns errors for invalid TOML.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(RelayError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - DEEPGRAM_API_KEY → transcription.api_key
    /// - OPENAI_API_KEY → reply.api_key
    /// - PORT → port of server.listen
    /// - CALLRELAY_DRAIN_DELAY_MS → session.drain_delay
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(key) = std::env::var("DEEPGRAM_API_KEY")
            && !key.is_empty()
        {
            self.transcription.api_key = Some(key);
        }

        if let Ok(key) = std::env::var("OPENAI_API_KEY")
            && !key.is_empty()
        {
            self.reply.api_key = Some(key);
        }

        if let Ok(port) = std::env::var("PORT")
            && let Ok(port) = port.trim().parse::<u16>()
        {
            self.server.listen = with_port(&self.server.listen, port);
        }

        if let Ok(ms) = std::env::var("CALLRELAY_DRAIN_DELAY_MS")
            && let Ok(ms) = ms.trim().parse::<u64>()
        {
            self.session.drain_delay = Duration::from_millis(ms);
        }

        self
    }

    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.session.drain_delay.is_zero() {
            return Err(invalid("session.drain_delay", "must be greater than zero"));
        }
        if self.session.pending_audio_max_frames == 0 {
            return Err(invalid(
                "session.pending_audio_max_frames",
                "must be at least 1",
            ));
        }
        if self.transcription.sample_rate == 0 {
            return Err(invalid("transcription.sample_rate", "must be positive"));
        }
        if self.transcription.open_timeout.is_zero() {
            return Err(invalid(
                "transcription.open_timeout",
                "must be greater than zero",
            ));
        }
        if !self.server.path.starts_with('/') {
            return Err(invalid("server.path", "must start with '/'"));
        }
        Ok(())
    }

    /// Copy of this config with API keys masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.transcription.api_key.is_some() {
            copy.transcription.api_key = Some("***".to_string());
        }
        if copy.reply.api_key.is_some() {
            copy.reply.api_key = Some("***".to_string());
        }
        copy
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/callrelay/config.toml on Linux
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("callrelay").join("config.toml"))
    }
}

fn invalid(key: &str, message: &str) -> RelayError {
    RelayError::ConfigInvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

/// Replace the port of a `host:port` listen address.
fn with_port(listen: &str, port: u16) -> String {
    match listen.rsplit_once(':') {
        Some((host, _)) => format!("{host}:{port}"),
        None => format!("{listen}:{port}"),
    }
}

/// Serde adapter storing durations as humantime strings ("1500ms", "10s").
mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}
