//! Composition root: wires production collaborators for the binary.

use crate::config::Config;
use crate::error::Result;
use crate::reply::{CollectorSink, LogSink, OpenAiReplyGenerator, ReplyClient, ReplySink, StdoutSink};
use crate::server::RelayServer;
use crate::session::{CallSession, SessionServices, SessionSummary};
use crate::upstream::{DeepgramConnector, LinkConfig};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Deepgram connector and chat-completions replies, delivered to `sink`.
pub fn build_services(config: &Config, sink: Arc<dyn ReplySink>) -> Result<SessionServices> {
    if config.transcription.api_key.is_none() {
        warn!("DEEPGRAM_API_KEY is not set; every call will fail to open its transcription link");
    }
    if config.reply.api_key.is_none() {
        warn!("OPENAI_API_KEY is not set; every reply will be the fallback");
    }

    let generator = OpenAiReplyGenerator::new(config.reply.clone())?;
    Ok(SessionServices {
        connector: Arc::new(DeepgramConnector::new(config.transcription.clone())),
        replies: ReplyClient::from_config(Arc::new(generator), &config.reply),
        sink,
    })
}

/// Run the media-stream server until SIGINT or SIGTERM.
pub async fn run_serve(config: Config) -> Result<()> {
    config.validate()?;
    let services = build_services(&config, Arc::new(LogSink))?;
    let server = RelayServer::bind(&config, services).await?;
    server.run_until(shutdown_signal()).await?;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "cannot listen for SIGTERM; only SIGINT stops the server"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for SIGINT");
    }
}

/// Split a recorded media stream into messages.
///
/// One JSON message per line; blank lines and `#` comments are skipped.
pub fn replay_lines(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Feed recorded messages through one session, `pace` apart, then close the
/// inbound side.
pub async fn replay_session(
    messages: Vec<String>,
    config: &Config,
    services: SessionServices,
    pace: Option<Duration>,
) -> SessionSummary {
    let (tx, rx) = mpsc::channel(crate::defaults::INBOUND_CHANNEL_CAPACITY);
    let session = CallSession::new(config.session.clone(), LinkConfig::from_config(config), services);
    let session = tokio::spawn(session.run(rx));

    for message in messages {
        if tx.send(message).await.is_err() {
            // Session ended early (link failure)
            break;
        }
        if let Some(pace) = pace {
            tokio::time::sleep(pace).await;
        }
    }
    drop(tx);

    match session.await {
        Ok(summary) => summary,
        Err(e) => {
            warn!(error = %e, "replay session task failed");
            SessionSummary::default()
        }
    }
}

/// Replay a recorded stream against the configured backends and print the
/// replies.
pub async fn run_replay(config: Config, file: &Path, pace: Option<Duration>) -> Result<SessionSummary> {
    config.validate()?;
    let contents = std::fs::read_to_string(file)?;
    let messages = replay_lines(&contents);
    info!(file = %file.display(), messages = messages.len(), "replaying media stream");

    let collector = CollectorSink::new();
    let services = build_services(&config, Arc::new(collector.clone()))?;
    let summary = replay_session(messages, &config, services, pace).await;

    // Reply tasks outlive the session; give them their full timeout
    let wait = config.reply.timeout + Duration::from_secs(1);
    let expected = summary.replies_dispatched as usize;
    let replies = match tokio::time::timeout(wait, collector.wait_for(expected)).await {
        Ok(replies) => replies,
        Err(_) => {
            warn!(expected, delivered = collector.len(), "not every reply finished in time");
            collector.replies()
        }
    };

    let stdout = StdoutSink;
    for (call_sid, reply) in &replies {
        stdout.deliver(call_sid, reply);
    }
    Ok(summary)
}
