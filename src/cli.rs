//! Command-line interface for callrelay
//!
//! Provides argument parsing using clap derive macros.

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use std::time::Duration;

/// Relay phone-call audio to live transcription and generate replies
#[derive(Parser, Debug)]
#[command(
    name = "callrelay",
    version,
    about = "Relay phone-call audio to live transcription and generate replies"
)]
pub struct Cli {
    /// Subcommand to execute (defaults to `serve`)
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose logging (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Parse a duration: bare number → milliseconds, otherwise humantime ("2s", "1500ms").
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<u64>() {
        return Ok(Duration::from_millis(ms));
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Available commands
#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Accept media streams and relay them (default)
    Serve {
        /// Listen address, overrides server.listen (e.g. 0.0.0.0:10000)
        #[arg(long, value_name = "ADDR")]
        listen: Option<String>,

        /// Grace period after end of audio, overrides session.drain_delay
        #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
        drain_delay: Option<Duration>,
    },

    /// Feed a recorded media stream (JSON lines) through one session
    Replay {
        /// File with one inbound JSON message per line
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Delay between messages (telephony frames are 20ms apart)
        #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
        pace: Option<Duration>,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

impl Default for Commands {
    fn default() -> Self {
        Commands::Serve {
            listen: None,
            drain_delay: None,
        }
    }
}

/// Configuration actions
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum ConfigAction {
    /// Print the effective configuration (API keys masked)
    Show,
    /// Print the configuration file path
    Path,
}
