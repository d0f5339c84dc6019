//! Lifecycle of one streaming transcription connection.
//!
//! ```text
//!            open()                Opened               close()            drain elapsed
//!   ──────▶ Pending ─────────────▶ Open ─────────────▶ Closing ─────────▶ Closed
//!              │                                          ▲                  ▲
//!              └── timeout / refused ──▶ Error ───────────┼──────────────────┘
//!              └── close() before open ───────────────────┘
//! ```
//!
//! A driver task owns the transport. The session talks to it through a
//! [`LinkHandle`] (audio and close commands) and hears back through
//! [`LinkEvent`]s. `Closed` is always the last event a driver emits.

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::stream::AudioFrame;
use crate::upstream::protocol::{self, BackendMessage, ControlMessage, TranscriptEvent};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, warn};

/// Opens transport connections to a transcription backend.
///
/// Shared by every session; each call gets its own transport.
#[async_trait]
pub trait TranscriptionConnector: Send + Sync {
    /// Establish a new connection, ready to accept audio.
    async fn connect(&self) -> Result<Box<dyn UpstreamTransport>>;

    /// Backend name used in log lines.
    fn name(&self) -> &str {
        "transcription"
    }
}

/// One established connection to a transcription backend.
#[async_trait]
pub trait UpstreamTransport: Send {
    /// Send one chunk of raw audio.
    async fn send_audio(&mut self, audio: Vec<u8>) -> Result<()>;

    /// Send a control message on the same connection.
    async fn send_control(&mut self, control: ControlMessage) -> Result<()>;

    /// Next text message from the backend. `None` once the backend closed.
    ///
    /// Must be cancel safe: it is polled inside `select!`.
    async fn recv(&mut self) -> Option<Result<String>>;

    /// Release the connection.
    async fn close(&mut self) -> Result<()>;
}

/// Notifications from the link driver to its session.
#[derive(Debug)]
pub enum LinkEvent {
    /// The backend accepted the connection.
    Opened,
    /// Recognized text arrived.
    Transcript(TranscriptEvent),
    /// The link failed. Followed by `Closed`.
    Error(RelayError),
    /// The connection is gone; no further events follow.
    Closed,
}

/// Timing knobs for a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Give up on a connection attempt after this long.
    pub open_timeout: Duration,
    /// Keep reading results for this long after `CloseStream`.
    pub drain_delay: Duration,
    /// Send `KeepAlive` after this much idle time. `None` disables it.
    pub keepalive_interval: Option<Duration>,
}

impl LinkConfig {
    pub fn from_config(config: &Config) -> Self {
        let keepalive = config.transcription.keepalive_interval;
        Self {
            open_timeout: config.transcription.open_timeout,
            drain_delay: config.session.drain_delay,
            keepalive_interval: (!keepalive.is_zero()).then_some(keepalive),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LinkCommand {
    Audio(Vec<u8>),
    Close,
}

/// Outcome of [`LinkHandle::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// This call asked the driver to end the stream.
    Requested,
    /// An earlier call already did; nothing was sent.
    AlreadyRequested,
}

/// Outcome of [`LinkHandle::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    /// Queued for the transport in submission order.
    Sent,
    /// The link is closing or gone; the frame was discarded.
    Dropped,
}

/// Session-side handle to a running link.
#[derive(Debug)]
pub struct LinkHandle {
    commands: mpsc::UnboundedSender<LinkCommand>,
    close_requested: bool,
    driver: Option<JoinHandle<()>>,
}

impl LinkHandle {
    /// Queue an audio frame. Never blocks.
    pub fn submit(&self, frame: AudioFrame) -> Submit {
        if self.close_requested {
            return Submit::Dropped;
        }
        match self.commands.send(LinkCommand::Audio(frame.payload)) {
            Ok(()) => Submit::Sent,
            Err(_) => Submit::Dropped,
        }
    }

    /// Ask the driver to end the stream. Only the first call has an effect.
    pub fn close(&mut self) -> CloseOutcome {
        if self.close_requested {
            return CloseOutcome::AlreadyRequested;
        }
        self.close_requested = true;
        if self.commands.send(LinkCommand::Close).is_err() {
            debug!("link driver already stopped");
        }
        CloseOutcome::Requested
    }

    pub fn is_close_requested(&self) -> bool {
        self.close_requested
    }

    /// Wait for the driver task to finish.
    pub async fn join(mut self) {
        if let Some(driver) = self.driver.take()
            && let Err(e) = driver.await
        {
            warn!(error = %e, "transcription link driver task failed");
        }
    }

    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<LinkCommand>) {
        let (commands, raw) = mpsc::unbounded_channel();
        (
            Self {
                commands,
                close_requested: false,
                driver: None,
            },
            raw,
        )
    }
}

/// Entry point for starting links.
pub struct UpstreamLink;

impl UpstreamLink {
    /// Start connecting in the background and return immediately.
    ///
    /// Progress is reported on `events`, starting with `Opened` or `Error`
    /// and always ending with `Closed`.
    pub fn open(
        connector: Arc<dyn TranscriptionConnector>,
        config: LinkConfig,
        events: mpsc::Sender<LinkEvent>,
    ) -> LinkHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(async move {
            LinkDriver {
                connector,
                config,
                commands: commands_rx,
                events,
            }
            .run()
            .await;
        });
        LinkHandle {
            commands: commands_tx,
            close_requested: false,
            driver: Some(driver),
        }
    }
}

struct LinkDriver {
    connector: Arc<dyn TranscriptionConnector>,
    config: LinkConfig,
    commands: mpsc::UnboundedReceiver<LinkCommand>,
    events: mpsc::Sender<LinkEvent>,
}

enum ReadOutcome {
    Continue,
    SessionGone,
}

impl LinkDriver {
    async fn run(mut self) {
        let Some(mut transport) = self.connect().await else {
            self.emit(LinkEvent::Closed).await;
            return;
        };

        info!(backend = self.connector.name(), "transcription link open");
        if self.emit(LinkEvent::Opened).await {
            self.stream(&mut transport).await;
        }

        if let Err(e) = transport.close().await {
            debug!(error = %e, "error while closing transcription transport");
        }
        self.emit(LinkEvent::Closed).await;
    }

    /// Connect, racing the attempt against the open timeout and an early
    /// close request. `None` means there is nothing to stream to.
    async fn connect(&mut self) -> Option<Box<dyn UpstreamTransport>> {
        let connector = Arc::clone(&self.connector);
        let attempt = timeout(self.config.open_timeout, connector.connect());
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => {
                    let error = match result {
                        Ok(Ok(transport)) => return Some(transport),
                        Ok(Err(RelayError::LinkOpen { message })) => RelayError::LinkOpen { message },
                        Ok(Err(e)) => RelayError::LinkOpen { message: e.to_string() },
                        Err(_) => RelayError::LinkOpen {
                            message: format!(
                                "no connection within {}",
                                humantime::format_duration(self.config.open_timeout)
                            ),
                        },
                    };
                    warn!(backend = self.connector.name(), error = %error, "transcription link failed to open");
                    self.emit(LinkEvent::Error(error)).await;
                    return None;
                }
                command = self.commands.recv() => match command {
                    Some(LinkCommand::Audio(_)) => {
                        debug!("audio reached the link before it opened; dropping");
                    }
                    Some(LinkCommand::Close) | None => {
                        info!("close requested before transcription link opened; abandoning connect");
                        return None;
                    }
                }
            }
        }
    }

    async fn stream(&mut self, transport: &mut Box<dyn UpstreamTransport>) {
        let keepalive = self.config.keepalive_interval;
        let mut last_sent = Instant::now();
        let mut drain_deadline: Option<Instant> = None;

        loop {
            // Never polled when keep-alive is disabled
            let keepalive_at = last_sent + keepalive.unwrap_or(self.config.open_timeout);
            let drain_at = drain_deadline.unwrap_or_else(Instant::now);

            tokio::select! {
                command = self.commands.recv(), if drain_deadline.is_none() => match command {
                    Some(LinkCommand::Audio(bytes)) => {
                        if let Err(e) = transport.send_audio(bytes).await {
                            self.fail(e).await;
                            return;
                        }
                        last_sent = Instant::now();
                    }
                    Some(LinkCommand::Close) | None => {
                        debug!(drain = %humantime::format_duration(self.config.drain_delay), "ending transcription stream");
                        if let Err(e) = transport.send_control(ControlMessage::CloseStream).await {
                            debug!(error = %e, "failed to send CloseStream");
                        }
                        drain_deadline = Some(Instant::now() + self.config.drain_delay);
                    }
                },
                message = transport.recv() => match message {
                    Some(Ok(text)) => {
                        if let ReadOutcome::SessionGone = self.handle_backend_text(&text).await {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        self.fail(e).await;
                        return;
                    }
                    None => {
                        if drain_deadline.is_none() {
                            warn!(backend = self.connector.name(), "transcription backend closed the connection");
                        } else {
                            debug!("transcription backend finished before drain delay elapsed");
                        }
                        return;
                    }
                },
                _ = sleep_until(drain_at), if drain_deadline.is_some() => {
                    debug!("drain delay elapsed");
                    return;
                }
                _ = sleep_until(keepalive_at), if keepalive.is_some() && drain_deadline.is_none() => {
                    if let Err(e) = transport.send_control(ControlMessage::KeepAlive).await {
                        self.fail(e).await;
                        return;
                    }
                    debug!("sent keep-alive");
                    last_sent = Instant::now();
                }
            }
        }
    }

    async fn handle_backend_text(&mut self, text: &str) -> ReadOutcome {
        let event = match protocol::parse_backend_message(text) {
            Ok(BackendMessage::Transcript(transcript)) => LinkEvent::Transcript(transcript),
            Ok(BackendMessage::Error(description)) => {
                warn!(backend = self.connector.name(), error = %description, "transcription backend reported an error");
                LinkEvent::Error(RelayError::LinkRuntime {
                    message: description,
                })
            }
            Ok(other) => {
                debug!(message = ?other, "backend message");
                return ReadOutcome::Continue;
            }
            Err(e) => {
                warn!(error = %e, "ignoring unreadable backend message");
                return ReadOutcome::Continue;
            }
        };

        if self.emit(event).await {
            ReadOutcome::Continue
        } else {
            ReadOutcome::SessionGone
        }
    }

    async fn fail(&mut self, error: RelayError) {
        let error = match error {
            e @ RelayError::LinkRuntime { .. } => e,
            e => RelayError::LinkRuntime {
                message: e.to_string(),
            },
        };
        warn!(backend = self.connector.name(), error = %error, "transcription link failed");
        self.emit(LinkEvent::Error(error)).await;
    }

    /// Returns `false` once the session stopped listening.
    async fn emit(&mut self, event: LinkEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::mock::MockConnector;
    use crate::upstream::protocol::results_message;

    fn config() -> LinkConfig {
        LinkConfig {
            open_timeout: Duration::from_secs(10),
            drain_delay: Duration::from_millis(1500),
            keepalive_interval: None,
        }
    }

    fn frame(byte: u8) -> AudioFrame {
        AudioFrame::new(byte as u64, vec![byte])
    }

    async fn next(events: &mut mpsc::Receiver<LinkEvent>) -> LinkEvent {
        tokio::time::timeout(Duration::from_secs(60), events.recv())
            .await
            .expect("timed out waiting for link event")
            .expect("link event channel closed")
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_then_forward_audio_in_order() {
        let connector = MockConnector::new();
        let (tx, mut events) = mpsc::channel(16);
        let mut link = UpstreamLink::open(Arc::new(connector.clone()), config(), tx);

        assert!(matches!(next(&mut events).await, LinkEvent::Opened));
        for byte in 1..=3 {
            assert_eq!(link.submit(frame(byte)), Submit::Sent);
        }
        assert_eq!(link.close(), CloseOutcome::Requested);
        assert!(matches!(next(&mut events).await, LinkEvent::Closed));

        assert_eq!(connector.submissions(), vec![vec![1], vec![2], vec![3]]);
        assert_eq!(connector.close_stream_count(), 1);
        assert!(connector.transport_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_only_issued_once() {
        let connector = MockConnector::new();
        let (tx, mut events) = mpsc::channel(16);
        let mut link = UpstreamLink::open(Arc::new(connector.clone()), config(), tx);

        assert!(matches!(next(&mut events).await, LinkEvent::Opened));
        assert_eq!(link.close(), CloseOutcome::Requested);
        assert_eq!(link.close(), CloseOutcome::AlreadyRequested);
        assert!(link.is_close_requested());
        assert_eq!(link.submit(frame(9)), Submit::Dropped);

        assert!(matches!(next(&mut events).await, LinkEvent::Closed));
        assert_eq!(connector.close_stream_count(), 1);
        assert!(connector.submissions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transcripts_during_drain_are_delivered() {
        let connector = MockConnector::new();
        let backend = connector.backend();
        let (tx, mut events) = mpsc::channel(16);
        let mut link = UpstreamLink::open(Arc::new(connector.clone()), config(), tx);

        assert!(matches!(next(&mut events).await, LinkEvent::Opened));
        link.close();
        connector.wait_for_close_stream().await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        backend.send_text(&results_message("last words", true));

        match next(&mut events).await {
            LinkEvent::Transcript(t) => assert_eq!(t.text, "last words"),
            other => panic!("Expected Transcript, got {:?}", other),
        }
        assert!(matches!(next(&mut events).await, LinkEvent::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_delay_bounds_the_close() {
        let connector = MockConnector::new();
        let (tx, mut events) = mpsc::channel(16);
        let mut link = UpstreamLink::open(Arc::new(connector.clone()), config(), tx);
        assert!(matches!(next(&mut events).await, LinkEvent::Opened));

        let started = Instant::now();
        link.close();
        assert!(matches!(next(&mut events).await, LinkEvent::Closed));
        assert!(started.elapsed() >= Duration::from_millis(1500));
        assert!(started.elapsed() < Duration::from_millis(1600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_close_during_drain_ends_early() {
        let connector = MockConnector::new();
        let backend = connector.backend();
        let (tx, mut events) = mpsc::channel(16);
        let mut link = UpstreamLink::open(Arc::new(connector.clone()), config(), tx);
        assert!(matches!(next(&mut events).await, LinkEvent::Opened));

        let started = Instant::now();
        link.close();
        connector.wait_for_close_stream().await;
        backend.close();

        assert!(matches!(next(&mut events).await, LinkEvent::Closed));
        assert!(started.elapsed() < Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_reports_error_then_closed() {
        let connector = MockConnector::failing("401 Unauthorized");
        let (tx, mut events) = mpsc::channel(16);
        let _link = UpstreamLink::open(Arc::new(connector.clone()), config(), tx);

        match next(&mut events).await {
            LinkEvent::Error(RelayError::LinkOpen { message }) => {
                assert!(message.contains("401"));
            }
            other => panic!("Expected LinkOpen error, got {:?}", other),
        }
        assert!(matches!(next(&mut events).await, LinkEvent::Closed));
        assert_eq!(connector.close_stream_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_timeout() {
        let connector = MockConnector::hanging();
        let (tx, mut events) = mpsc::channel(16);
        let started = Instant::now();
        let _link = UpstreamLink::open(Arc::new(connector), config(), tx);

        assert!(matches!(
            next(&mut events).await,
            LinkEvent::Error(RelayError::LinkOpen { .. })
        ));
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(matches!(next(&mut events).await, LinkEvent::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_before_open_abandons_connect() {
        let (connector, _gate) = MockConnector::gated();
        let (tx, mut events) = mpsc::channel(16);
        let mut link = UpstreamLink::open(Arc::new(connector.clone()), config(), tx);

        link.close();
        assert!(matches!(next(&mut events).await, LinkEvent::Closed));
        assert_eq!(connector.close_stream_count(), 0);
        link.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_reports_runtime_error() {
        let connector = MockConnector::new();
        let backend = connector.backend();
        let (tx, mut events) = mpsc::channel(16);
        let _link = UpstreamLink::open(Arc::new(connector.clone()), config(), tx);
        assert!(matches!(next(&mut events).await, LinkEvent::Opened));

        backend.fail("connection reset");
        match next(&mut events).await {
            LinkEvent::Error(RelayError::LinkRuntime { message }) => {
                assert!(message.contains("connection reset"));
            }
            other => panic!("Expected LinkRuntime error, got {:?}", other),
        }
        assert!(matches!(next(&mut events).await, LinkEvent::Closed));
        assert!(connector.transport_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_error_message_keeps_link_running() {
        let connector = MockConnector::new();
        let backend = connector.backend();
        let (tx, mut events) = mpsc::channel(16);
        let link = UpstreamLink::open(Arc::new(connector.clone()), config(), tx);
        assert!(matches!(next(&mut events).await, LinkEvent::Opened));

        backend.send_text(r#"{"type":"Error","description":"bad audio"}"#);
        assert!(matches!(
            next(&mut events).await,
            LinkEvent::Error(RelayError::LinkRuntime { .. })
        ));

        assert_eq!(link.submit(frame(4)), Submit::Sent);
        backend.send_text(&results_message("still here", true));
        assert!(matches!(next(&mut events).await, LinkEvent::Transcript(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_backend_messages_are_skipped() {
        let connector = MockConnector::new();
        let backend = connector.backend();
        let (tx, mut events) = mpsc::channel(16);
        let _link = UpstreamLink::open(Arc::new(connector.clone()), config(), tx);
        assert!(matches!(next(&mut events).await, LinkEvent::Opened));

        backend.send_text("garbage");
        backend.send_text(r#"{"type":"Metadata"}"#);
        backend.send_text(&results_message("ok", true));

        match next(&mut events).await {
            LinkEvent::Transcript(t) => assert_eq!(t.text, "ok"),
            other => panic!("Expected Transcript, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_sent_when_idle() {
        let connector = MockConnector::new();
        let (tx, mut events) = mpsc::channel(16);
        let cfg = LinkConfig {
            keepalive_interval: Some(Duration::from_secs(8)),
            ..config()
        };
        let link = UpstreamLink::open(Arc::new(connector.clone()), cfg, tx);
        assert!(matches!(next(&mut events).await, LinkEvent::Opened));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(connector.keepalive_count(), 2);

        // Audio resets the idle clock
        link.submit(frame(1));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(connector.keepalive_count(), 2);
    }

    #[test]
    fn test_link_config_from_defaults() {
        let cfg = LinkConfig::default();
        assert_eq!(cfg.open_timeout, Duration::from_secs(10));
        assert_eq!(cfg.drain_delay, Duration::from_millis(1500));
        assert_eq!(cfg.keepalive_interval, Some(Duration::from_secs(8)));
    }

    #[test]
    fn test_zero_keepalive_disables_it() {
        let mut config = Config::default();
        config.transcription.keepalive_interval = Duration::ZERO;
        assert_eq!(LinkConfig::from_config(&config).keepalive_interval, None);
    }
}
