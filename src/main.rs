use anyhow::{Context, Result};
use callrelay::cli::{Cli, Commands, ConfigAction};
use callrelay::config::Config;
use callrelay::error::RelayError;
use clap::{CommandFactory, Parser};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match cli.command.unwrap_or_default() {
        Commands::Serve {
            listen,
            drain_delay,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            if let Some(delay) = drain_delay {
                config.session.drain_delay = delay;
            }
            tracing::info!(version = %callrelay::version_string(), "starting callrelay");
            callrelay::app::run_serve(config).await?;
        }
        Commands::Replay { file, pace } => {
            let config = load_config(cli.config.as_deref())?;
            let summary = callrelay::app::run_replay(config, &file, pace)
                .await
                .with_context(|| format!("replay of {} failed", file.display()))?;
            eprintln!(
                "call {}: {} frames ({} forwarded, {} dropped), {} transcripts, {} replies",
                summary.call_sid.as_deref().unwrap_or("-"),
                summary.frames_received,
                summary.frames_forwarded,
                summary.frames_dropped,
                summary.transcripts,
                summary.replies_dispatched,
            );
        }
        Commands::Config { action } => handle_config_command(action, cli.config.as_deref())?,
        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "callrelay",
                &mut std::io::stdout(),
            );
        }
    }

    Ok(())
}

/// RUST_LOG wins; otherwise -q / -v pick the level for this crate.
fn init_tracing(verbose: u8, quiet: bool) {
    let default_directive = match (quiet, verbose) {
        (true, _) => "callrelay=warn",
        (false, 0) => "callrelay=info",
        (false, 1) => "callrelay=debug",
        (false, _) => "callrelay=trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn config_path(custom_path: Option<&Path>) -> Option<PathBuf> {
    custom_path.map(Path::to_path_buf).or_else(Config::default_path)
}

fn load_config(custom_path: Option<&Path>) -> Result<Config> {
    let config = match custom_path {
        Some(path) => {
            if !path.exists() {
                return Err(RelayError::ConfigFileNotFound {
                    path: path.display().to_string(),
                }
                .into());
            }
            Config::load(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?
        }
        None => match Config::default_path() {
            Some(path) => Config::load_or_default(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => Config::default(),
        },
    };

    // Apply environment variable overrides
    Ok(config.with_env_overrides())
}

fn handle_config_command(action: ConfigAction, custom_path: Option<&Path>) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config(custom_path)?;
            let rendered =
                toml::to_string_pretty(&config.redacted()).context("failed to render config")?;
            print!("{rendered}");
        }
        ConfigAction::Path => match config_path(custom_path) {
            Some(path) => println!("{}", path.display()),
            None => anyhow::bail!("no configuration directory available on this system"),
        },
    }
    Ok(())
}
