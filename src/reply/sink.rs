//! Where generated replies go.

use crate::reply::generator::GeneratedReply;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tracing::{info, warn};

/// Consumer of generated replies.
///
/// Called from reply tasks, possibly concurrently for one call.
pub trait ReplySink: Send + Sync {
    /// Handle one reply for the given call.
    fn deliver(&self, call_sid: &str, reply: &GeneratedReply);

    /// Name for logging/debugging.
    fn name(&self) -> &'static str {
        "sink"
    }
}

/// Writes replies to the log. Nothing is spoken back to the caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ReplySink for LogSink {
    fn deliver(&self, call_sid: &str, reply: &GeneratedReply) {
        info!(
            call_sid,
            event = "reply",
            transcript = %reply.transcript,
            text = %reply.text,
            fallback = reply.is_fallback,
            "reply ready"
        );
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Prints one line per reply on stdout. Used by `replay`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl ReplySink for StdoutSink {
    fn deliver(&self, _call_sid: &str, reply: &GeneratedReply) {
        let marker = if reply.is_fallback { " (fallback)" } else { "" };
        let mut out = std::io::stdout().lock();
        if let Err(e) = writeln!(out, "> {}\n< {}{}", reply.transcript, reply.text, marker) {
            warn!(error = %e, "failed to write reply to stdout");
        }
    }

    fn name(&self) -> &'static str {
        "stdout"
    }
}

/// Collects replies in memory, for tests and library use.
#[derive(Debug, Default, Clone)]
pub struct CollectorSink {
    inner: Arc<CollectorInner>,
}

#[derive(Debug, Default)]
struct CollectorInner {
    replies: Mutex<Vec<(String, GeneratedReply)>>,
    delivered: Notify,
}

impl CollectorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(call_sid, reply)` pairs in delivery order.
    pub fn replies(&self) -> Vec<(String, GeneratedReply)> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Wait until at least `count` replies have been delivered.
    pub async fn wait_for(&self, count: usize) -> Vec<(String, GeneratedReply)> {
        loop {
            let delivered = self.inner.delivered.notified();
            {
                let replies = self.lock();
                if replies.len() >= count {
                    return replies.clone();
                }
            }
            delivered.await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(String, GeneratedReply)>> {
        self.inner
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl ReplySink for CollectorSink {
    fn deliver(&self, call_sid: &str, reply: &GeneratedReply) {
        self.lock().push((call_sid.to_string(), reply.clone()));
        self.inner.delivered.notify_waiters();
    }

    fn name(&self) -> &'static str {
        "collector"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(text: &str) -> GeneratedReply {
        GeneratedReply {
            transcript: "hi".to_string(),
            text: text.to_string(),
            is_fallback: false,
        }
    }

    #[test]
    fn test_collector_keeps_delivery_order() {
        let sink = CollectorSink::new();
        assert!(sink.is_empty());

        sink.deliver("CA1", &reply("first"));
        sink.deliver("CA1", &reply("second"));

        let replies = sink.replies();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].0, "CA1");
        assert_eq!(replies[0].1.text, "first");
        assert_eq!(replies[1].1.text, "second");
    }

    #[test]
    fn test_collector_clones_share_storage() {
        let sink = CollectorSink::new();
        let clone = sink.clone();
        clone.deliver("CA2", &reply("x"));
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_resolves_after_delivery() {
        let sink = CollectorSink::new();
        let producer = sink.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            producer.deliver("CA3", &reply("late"));
        });

        let replies = sink.wait_for(1).await;
        assert_eq!(replies[0].1.text, "late");
    }

    #[test]
    fn test_sink_names() {
        assert_eq!(LogSink.name(), "log");
        assert_eq!(StdoutSink.name(), "stdout");
        assert_eq!(CollectorSink::new().name(), "collector");
    }
}
