//! One telephone call: inbound media stream in, transcripts out, replies
//! generated on the side.
//!
//! All call state lives in [`CallSession`] and is only touched from its
//! `run` loop, which reacts to two sources: raw inbound messages and
//! [`LinkEvent`]s from the transcription link. Reply generation runs on
//! detached tasks and reports only to the [`ReplySink`].

use crate::config::SessionConfig;
use crate::reply::{ReplyClient, ReplySink};
use crate::session::state::{LinkState, SessionState};
use crate::stream::{AudioFrame, Enqueue, FrameDecoder, InboundEvent, PendingAudio};
use crate::upstream::{
    LinkConfig, LinkEvent, LinkHandle, Submit, TranscriptEvent, TranscriptionConnector,
    UpstreamLink,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

const LINK_EVENT_CAPACITY: usize = 64;

/// Collaborators shared by every call on a server.
#[derive(Clone)]
pub struct SessionServices {
    pub connector: Arc<dyn TranscriptionConnector>,
    pub replies: ReplyClient,
    pub sink: Arc<dyn ReplySink>,
}

impl std::fmt::Debug for SessionServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionServices")
            .field("connector", &self.connector.name())
            .field("replies", &self.replies)
            .field("sink", &self.sink.name())
            .finish()
    }
}

/// Counters reported when a call ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub call_sid: Option<String>,
    /// Non-empty audio frames decoded.
    pub frames_received: u64,
    /// Frames handed to the link, buffered ones included.
    pub frames_forwarded: u64,
    /// Frames that waited for the link to open.
    pub frames_buffered: u64,
    /// Frames that never reached the link.
    pub frames_dropped: u64,
    pub empty_payloads: u64,
    pub malformed_messages: u64,
    /// Transcript events received, blank ones included.
    pub transcripts: u64,
    pub replies_dispatched: u64,
    pub link_opened: bool,
}

/// State for one call. Consumed by [`CallSession::run`].
pub struct CallSession {
    config: SessionConfig,
    link_config: LinkConfig,
    services: SessionServices,
    state: SessionState,
    link_state: LinkState,
    call_sid: Option<String>,
    decoder: FrameDecoder,
    pending: PendingAudio,
    close_requested: bool,
    inbound_closed: bool,
    summary: SessionSummary,
}

impl CallSession {
    pub fn new(config: SessionConfig, link_config: LinkConfig, services: SessionServices) -> Self {
        let pending = PendingAudio::new(config.pending_audio_max_frames);
        Self {
            config,
            link_config,
            services,
            state: SessionState::Initializing,
            link_state: LinkState::Pending,
            call_sid: None,
            decoder: FrameDecoder::new(),
            pending,
            close_requested: false,
            inbound_closed: false,
            summary: SessionSummary::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn link_state(&self) -> LinkState {
        self.link_state
    }

    /// Drive the call to completion.
    ///
    /// `inbound` carries raw text messages from the telephony socket; the
    /// channel closing means the socket closed. Returns once the
    /// transcription link has been released.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<String>) -> SessionSummary {
        let (events_tx, mut events) = mpsc::channel(LINK_EVENT_CAPACITY);
        let mut link = UpstreamLink::open(
            Arc::clone(&self.services.connector),
            self.link_config.clone(),
            events_tx,
        );
        debug!(
            backend = self.services.connector.name(),
            event = "link_requested",
            "opening transcription link"
        );

        while self.state != SessionState::Closed {
            tokio::select! {
                // Link lifecycle first so a pending flush happens before
                // the next inbound frame is looked at
                biased;
                event = events.recv() => {
                    let event = event.unwrap_or(LinkEvent::Closed);
                    self.on_link_event(event, &mut link);
                }
                message = inbound.recv(), if !self.inbound_closed => match message {
                    Some(text) => self.on_inbound(&text, &mut link),
                    None => self.on_inbound_closed(&mut link),
                },
            }
        }

        link.join().await;
        self.summary.call_sid = self.call_sid.take();
        self.summary
    }

    fn call_label(&self) -> &str {
        self.call_sid.as_deref().unwrap_or("-")
    }

    fn on_inbound(&mut self, raw: &str, link: &mut LinkHandle) {
        let event = match self.decoder.decode(raw) {
            Ok(event) => event,
            Err(e) => {
                self.summary.malformed_messages += 1;
                warn!(call_sid = self.call_label(), error = %e, "dropping malformed inbound message");
                return;
            }
        };
        trace!(call_sid = self.call_label(), kind = event.kind(), state = %self.state, "inbound event");

        match event {
            InboundEvent::Start {
                call_sid,
                stream_sid,
            } => {
                if let Some(existing) = &self.call_sid {
                    warn!(call_sid = %existing, new_call_sid = %call_sid, "duplicate start event ignored");
                    return;
                }
                info!(
                    call_sid = %call_sid,
                    stream_sid = stream_sid.as_deref().unwrap_or("-"),
                    event = "start",
                    "call started"
                );
                self.call_sid = Some(call_sid);
            }
            InboundEvent::Media(frame) => self.on_media(frame, link),
            InboundEvent::EmptyPayload => {
                self.summary.empty_payloads += 1;
                debug!(call_sid = self.call_label(), event = "media", bytes = 0, "empty audio payload dropped");
            }
            InboundEvent::Stop => {
                info!(call_sid = self.call_label(), event = "stop", "media stream stopped");
                self.begin_drain("stop", link);
            }
            InboundEvent::Ignored(name) => {
                debug!(call_sid = self.call_label(), event = %name, "ignoring inbound event");
            }
        }
    }

    fn on_inbound_closed(&mut self, link: &mut LinkHandle) {
        self.inbound_closed = true;
        info!(call_sid = self.call_label(), event = "inbound_closed", "media stream socket closed");
        self.begin_drain("inbound closed", link);
    }

    fn on_media(&mut self, frame: AudioFrame, link: &LinkHandle) {
        self.summary.frames_received += 1;
        let bytes = frame.len();
        trace!(call_sid = self.call_label(), event = "media", bytes, sequence = frame.sequence);

        if !self.state.accepts_audio() {
            self.summary.frames_dropped += 1;
            warn!(
                call_sid = self.call_label(),
                event = "media",
                bytes,
                state = %self.state,
                "audio after end of stream not forwarded"
            );
            return;
        }

        match self.link_state {
            LinkState::Pending => match self.pending.enqueue(frame) {
                Enqueue::Stored => self.summary.frames_buffered += 1,
                Enqueue::DroppedOldest => {
                    self.summary.frames_buffered += 1;
                    self.summary.frames_dropped += 1;
                    warn!(
                        call_sid = self.call_label(),
                        held = self.pending.len(),
                        "pending audio full; dropped oldest frame"
                    );
                }
                Enqueue::Bypassed => {
                    self.summary.frames_dropped += 1;
                    warn!(call_sid = self.call_label(), "pending audio already released; frame dropped");
                }
            },
            state if state.accepts_audio() => self.submit(frame, link),
            other => {
                self.summary.frames_dropped += 1;
                warn!(
                    call_sid = self.call_label(),
                    bytes,
                    link = %other,
                    "transcription link not accepting audio; frame dropped"
                );
            }
        }
    }

    fn submit(&mut self, frame: AudioFrame, link: &LinkHandle) {
        match link.submit(frame) {
            Submit::Sent => self.summary.frames_forwarded += 1,
            Submit::Dropped => {
                self.summary.frames_dropped += 1;
                warn!(call_sid = self.call_label(), "transcription link refused audio");
            }
        }
    }

    fn on_link_event(&mut self, event: LinkEvent, link: &mut LinkHandle) {
        match event {
            LinkEvent::Opened => self.on_link_opened(link),
            LinkEvent::Transcript(transcript) => self.on_transcript(transcript),
            LinkEvent::Error(e) => {
                warn!(call_sid = self.call_label(), event = "link_error", error = %e, "transcription link error");
                if self.link_state == LinkState::Pending {
                    self.link_state = LinkState::Error;
                    self.discard_pending();
                }
                self.begin_drain("link error", link);
            }
            LinkEvent::Closed => {
                self.link_state = LinkState::Closed;
                if !self.state.is_ending() {
                    warn!(call_sid = self.call_label(), "transcription link closed unexpectedly");
                    self.begin_drain("link closed", link);
                }
                self.discard_pending();
                self.state = SessionState::Closed;
                info!(
                    call_sid = self.call_label(),
                    event = "closed",
                    frames = self.summary.frames_received,
                    forwarded = self.summary.frames_forwarded,
                    transcripts = self.summary.transcripts,
                    replies = self.summary.replies_dispatched,
                    "call session closed"
                );
            }
        }
    }

    fn on_link_opened(&mut self, link: &mut LinkHandle) {
        self.summary.link_opened = true;
        if self.close_requested {
            debug!(call_sid = self.call_label(), "link opened after close was requested");
            return;
        }

        self.link_state = LinkState::Open;
        let mut forwarded = 0u64;
        let mut refused = 0u64;
        let flushed = self.pending.drain_into(|frame| match link.submit(frame) {
            Submit::Sent => forwarded += 1,
            Submit::Dropped => refused += 1,
        });
        self.summary.frames_forwarded += forwarded;
        self.summary.frames_dropped += refused;

        if self.state.is_ending() {
            // Audio ended during the handshake: close only after the flush
            info!(
                call_sid = self.call_label(),
                event = "link_open",
                flushed,
                "transcription link open; flushed buffered audio before closing"
            );
            self.request_close(link);
            return;
        }

        self.state = SessionState::Streaming;
        info!(
            call_sid = self.call_label(),
            event = "link_open",
            flushed,
            "transcription link open; streaming"
        );
    }

    fn on_transcript(&mut self, transcript: TranscriptEvent) {
        self.summary.transcripts += 1;
        if transcript.is_blank() {
            trace!(call_sid = self.call_label(), "blank transcript skipped");
            return;
        }
        let text = transcript.text.trim();

        info!(
            call_sid = self.call_label(),
            event = "transcript",
            text,
            is_final = transcript.is_final,
            speech_final = transcript.speech_final,
            "transcript"
        );
        if !self.config.reply_policy.accepts(transcript.is_final) {
            return;
        }

        self.summary.replies_dispatched += 1;
        let replies = self.services.replies.clone();
        let sink = Arc::clone(&self.services.sink);
        let call_sid = self.call_label().to_string();
        let text = text.to_string();
        tokio::spawn(async move {
            let reply = replies.reply(&text).await;
            sink.deliver(&call_sid, &reply);
        });
    }

    /// Enter `Draining` and ask the link to close, once.
    ///
    /// A link still connecting with audio buffered is left to open first so
    /// that audio is not lost; an open failure or timeout still ends it.
    fn begin_drain(&mut self, reason: &str, link: &mut LinkHandle) {
        if self.state.is_ending() {
            debug!(call_sid = self.call_label(), reason, "already draining");
            return;
        }
        self.state = SessionState::Draining;
        info!(call_sid = self.call_label(), event = "drain", reason, "draining call session");

        if self.link_state == LinkState::Pending && !self.pending.is_empty() {
            // Buffered audio is flushed by the open handler, which then closes
            info!(
                call_sid = self.call_label(),
                buffered = self.pending.len(),
                "waiting for transcription link to open"
            );
            return;
        }
        self.request_close(link);
    }

    fn request_close(&mut self, link: &mut LinkHandle) {
        if !self.close_requested && self.link_state.can_close() {
            self.close_requested = true;
            link.close();
            self.link_state = LinkState::Closing;
        }
    }

    fn discard_pending(&mut self) {
        let discarded = self.pending.discard();
        if discarded > 0 {
            self.summary.frames_dropped += discarded as u64;
            warn!(
                call_sid = self.call_label(),
                frames = discarded,
                "buffered audio discarded; link never opened"
            );
        }
    }
}
