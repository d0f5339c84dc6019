//! Scriptable in-process transcription backend for unit and integration tests.

use crate::error::{RelayError, Result};
use crate::upstream::link::{TranscriptionConnector, UpstreamTransport};
use crate::upstream::protocol::ControlMessage;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, mpsc};

#[derive(Debug)]
enum ConnectMode {
    Immediate,
    Fail(String),
    Hang,
    Gated(Arc<Notify>),
}

#[derive(Debug)]
enum BackendInput {
    Text(String),
    Fail(String),
    Close,
}

#[derive(Debug, Default)]
struct TransportLog {
    connects: usize,
    submissions: Vec<Vec<u8>>,
    controls: Vec<ControlMessage>,
    transport_closed: bool,
}

#[derive(Debug)]
struct Shared {
    mode: ConnectMode,
    log: Mutex<TransportLog>,
    activity: Notify,
    backend_tx: mpsc::UnboundedSender<BackendInput>,
    backend_rx: Mutex<Option<mpsc::UnboundedReceiver<BackendInput>>>,
}

impl Shared {
    fn log(&self) -> MutexGuard<'_, TransportLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Mock connector recording everything the link sends.
///
/// Each connector serves one connection; a second connect gets a transport
/// that never receives anything.
#[derive(Debug, Clone)]
pub struct MockConnector {
    shared: Arc<Shared>,
}

impl MockConnector {
    /// Connects immediately.
    pub fn new() -> Self {
        Self::with_mode(ConnectMode::Immediate)
    }

    /// Every connect attempt is refused with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_mode(ConnectMode::Fail(message.into()))
    }

    /// Connect attempts never complete.
    pub fn hanging() -> Self {
        Self::with_mode(ConnectMode::Hang)
    }

    /// Connect attempts wait until the returned gate is opened.
    pub fn gated() -> (Self, OpenGate) {
        let notify = Arc::new(Notify::new());
        let connector = Self::with_mode(ConnectMode::Gated(Arc::clone(&notify)));
        (connector, OpenGate { notify })
    }

    fn with_mode(mode: ConnectMode) -> Self {
        let (backend_tx, backend_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                mode,
                log: Mutex::new(TransportLog::default()),
                activity: Notify::new(),
                backend_tx,
                backend_rx: Mutex::new(Some(backend_rx)),
            }),
        }
    }

    /// Handle for injecting backend messages.
    pub fn backend(&self) -> MockBackend {
        MockBackend {
            tx: self.shared.backend_tx.clone(),
        }
    }

    /// Audio payloads received, in order.
    pub fn submissions(&self) -> Vec<Vec<u8>> {
        self.shared.log().submissions.clone()
    }

    pub fn controls(&self) -> Vec<ControlMessage> {
        self.shared.log().controls.clone()
    }

    /// Number of `CloseStream` messages received.
    pub fn close_stream_count(&self) -> usize {
        self.count_controls(ControlMessage::CloseStream)
    }

    pub fn keepalive_count(&self) -> usize {
        self.count_controls(ControlMessage::KeepAlive)
    }

    /// Connect attempts, refused ones included.
    pub fn connect_count(&self) -> usize {
        self.shared.log().connects
    }

    /// Whether the link released its transport.
    pub fn transport_closed(&self) -> bool {
        self.shared.log().transport_closed
    }

    /// Resolve once a `CloseStream` has been received.
    pub async fn wait_for_close_stream(&self) {
        loop {
            let notified = self.shared.activity.notified();
            if self.close_stream_count() > 0 {
                return;
            }
            notified.await;
        }
    }

    /// Resolve once at least `count` audio payloads have been received.
    pub async fn wait_for_submissions(&self, count: usize) {
        loop {
            let notified = self.shared.activity.notified();
            if self.shared.log().submissions.len() >= count {
                return;
            }
            notified.await;
        }
    }

    fn count_controls(&self, kind: ControlMessage) -> usize {
        self.shared
            .log()
            .controls
            .iter()
            .filter(|c| **c == kind)
            .count()
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TranscriptionConnector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn UpstreamTransport>> {
        self.shared.log().connects += 1;
        match &self.shared.mode {
            ConnectMode::Immediate => {}
            ConnectMode::Fail(message) => {
                return Err(RelayError::LinkOpen {
                    message: message.clone(),
                });
            }
            ConnectMode::Hang => std::future::pending::<()>().await,
            ConnectMode::Gated(notify) => notify.notified().await,
        }

        let inbound = self
            .shared
            .backend_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(Box::new(MockTransport {
            shared: Arc::clone(&self.shared),
            inbound,
        }))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Releases a gated connector's pending connect.
#[derive(Debug)]
pub struct OpenGate {
    notify: Arc<Notify>,
}

impl OpenGate {
    pub fn open(&self) {
        self.notify.notify_one();
    }
}

/// Injects messages as if sent by the backend.
#[derive(Debug, Clone)]
pub struct MockBackend {
    tx: mpsc::UnboundedSender<BackendInput>,
}

impl MockBackend {
    /// Deliver a text message. Returns `false` if nobody is listening.
    pub fn send_text(&self, text: &str) -> bool {
        self.tx.send(BackendInput::Text(text.to_string())).is_ok()
    }

    /// Fail the connection with a transport error.
    pub fn fail(&self, message: &str) -> bool {
        self.tx.send(BackendInput::Fail(message.to_string())).is_ok()
    }

    /// Close the connection from the backend side.
    pub fn close(&self) -> bool {
        self.tx.send(BackendInput::Close).is_ok()
    }
}

struct MockTransport {
    shared: Arc<Shared>,
    inbound: Option<mpsc::UnboundedReceiver<BackendInput>>,
}

#[async_trait]
impl UpstreamTransport for MockTransport {
    async fn send_audio(&mut self, audio: Vec<u8>) -> Result<()> {
        self.shared.log().submissions.push(audio);
        self.shared.activity.notify_waiters();
        Ok(())
    }

    async fn send_control(&mut self, control: ControlMessage) -> Result<()> {
        self.shared.log().controls.push(control);
        self.shared.activity.notify_waiters();
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        let Some(inbound) = self.inbound.as_mut() else {
            return std::future::pending().await;
        };
        match inbound.recv().await {
            Some(BackendInput::Text(text)) => Some(Ok(text)),
            Some(BackendInput::Fail(message)) => Some(Err(RelayError::LinkRuntime { message })),
            Some(BackendInput::Close) | None => {
                self.inbound = None;
                None
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.shared.log().transport_closed = true;
        self.inbound = None;
        self.shared.activity.notify_waiters();
        Ok(())
    }
}
