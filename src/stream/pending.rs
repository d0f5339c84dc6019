//! Holding queue for audio that arrives before the transcription link opens.
//!
//! Frames are kept in arrival order and handed over exactly once when the
//! link opens. After that the buffer is bypassed for the rest of the call.

use crate::stream::frame::AudioFrame;
use std::collections::VecDeque;

/// Outcome of [`PendingAudio::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    /// Frame stored.
    Stored,
    /// Frame stored; the oldest held frame was dropped to stay under the bound.
    DroppedOldest,
    /// Buffer was already drained; the frame was not stored.
    Bypassed,
}

/// Bounded FIFO of audio frames waiting for the link to open.
#[derive(Debug)]
pub struct PendingAudio {
    frames: VecDeque<AudioFrame>,
    max_frames: usize,
    bytes: usize,
    dropped: u64,
    bypassed: bool,
}

impl PendingAudio {
    /// Creates a buffer holding at most `max_frames` frames (minimum 1).
    pub fn new(max_frames: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            max_frames: max_frames.max(1),
            bytes: 0,
            dropped: 0,
            bypassed: false,
        }
    }

    /// Append a frame, dropping the oldest one when the bound is reached.
    pub fn enqueue(&mut self, frame: AudioFrame) -> Enqueue {
        if self.bypassed {
            return Enqueue::Bypassed;
        }

        let mut outcome = Enqueue::Stored;
        if self.frames.len() >= self.max_frames
            && let Some(oldest) = self.frames.pop_front()
        {
            self.bytes -= oldest.len();
            self.dropped += 1;
            outcome = Enqueue::DroppedOldest;
        }

        self.bytes += frame.len();
        self.frames.push_back(frame);
        outcome
    }

    /// Hand every held frame to `sink` in arrival order, then bypass the
    /// buffer permanently. Returns the number of frames forwarded.
    ///
    /// A second call forwards nothing.
    pub fn drain_into<F>(&mut self, mut sink: F) -> usize
    where
        F: FnMut(AudioFrame),
    {
        if self.bypassed {
            return 0;
        }
        self.bypassed = true;
        self.bytes = 0;

        let count = self.frames.len();
        for frame in self.frames.drain(..) {
            sink(frame);
        }
        count
    }

    /// Throw away held frames without forwarding them and bypass the buffer.
    ///
    /// Used when the link fails before it ever opened.
    pub fn discard(&mut self) -> usize {
        let count = self.frames.len();
        self.frames.clear();
        self.bytes = 0;
        self.bypassed = true;
        count
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Total payload bytes currently held.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Frames dropped because the bound was hit.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypassed
    }
}
