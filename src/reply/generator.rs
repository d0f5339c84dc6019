//! Reply generation behind a trait, with a timeout and a fixed fallback.
//!
//! Sessions only see [`ReplyClient`]: whatever the generator does, the
//! caller always gets a reply back.

use crate::config::ReplyConfig;
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// Trait for turning a caller utterance into a reply.
///
/// Swappable so sessions can run against a mock.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// Produce a reply for one transcript.
    async fn generate(&self, transcript: &str) -> Result<String>;

    /// Name for logging/debugging.
    fn name(&self) -> &str;
}

/// A reply ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedReply {
    /// The transcript that prompted the reply.
    pub transcript: String,
    pub text: String,
    /// Generation failed or timed out and the fallback was used.
    pub is_fallback: bool,
}

/// Wraps a generator with a timeout and a fixed fallback reply.
///
/// [`ReplyClient::reply`] never fails; the call goes on regardless.
#[derive(Clone)]
pub struct ReplyClient {
    generator: Arc<dyn ReplyGenerator>,
    fallback: String,
    timeout: Duration,
}

impl ReplyClient {
    pub fn new(generator: Arc<dyn ReplyGenerator>, fallback: impl Into<String>, timeout: Duration) -> Self {
        Self {
            generator,
            fallback: fallback.into(),
            timeout,
        }
    }

    pub fn from_config(generator: Arc<dyn ReplyGenerator>, config: &ReplyConfig) -> Self {
        Self::new(generator, config.fallback.clone(), config.timeout)
    }

    pub fn generator_name(&self) -> &str {
        self.generator.name()
    }

    /// Generate a reply, substituting the fallback on any failure.
    pub async fn reply(&self, transcript: &str) -> GeneratedReply {
        debug_assert!(
            !transcript.trim().is_empty(),
            "blank transcript handed to the reply client"
        );
        let outcome = tokio::time::timeout(self.timeout, self.generator.generate(transcript)).await;

        let failure = match outcome {
            Ok(Ok(text)) if !text.trim().is_empty() => {
                debug!(generator = self.generator.name(), "reply generated");
                return GeneratedReply {
                    transcript: transcript.to_string(),
                    text,
                    is_fallback: false,
                };
            }
            Ok(Ok(_)) => "generator returned an empty reply".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!(
                "no reply within {}",
                humantime::format_duration(self.timeout)
            ),
        };

        warn!(
            generator = self.generator.name(),
            error = %failure,
            "reply generation failed; using fallback"
        );
        GeneratedReply {
            transcript: transcript.to_string(),
            text: self.fallback.clone(),
            is_fallback: true,
        }
    }
}

impl std::fmt::Debug for ReplyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyClient")
            .field("generator", &self.generator.name())
            .field("fallback", &self.fallback)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Mock generator for testing.
///
/// Clones share the prompt log.
#[derive(Debug, Clone)]
pub struct MockReplyGenerator {
    response: String,
    should_fail: bool,
    delay: Option<Duration>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl MockReplyGenerator {
    pub fn new() -> Self {
        Self {
            response: "mock reply".to_string(),
            should_fail: false,
            delay: None,
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Configure the mock to return a specific reply
    pub fn with_response(mut self, response: &str) -> Self {
        self.response = response.to_string();
        self
    }

    /// Configure the mock to fail on generate
    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }

    /// Sleep before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Transcripts received, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for MockReplyGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReplyGenerator for MockReplyGenerator {
    async fn generate(&self, transcript: &str) -> Result<String> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(transcript.to_string());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.should_fail {
            Err(RelayError::Generator {
                message: "mock generator failure".to_string(),
            })
        } else {
            Ok(self.response.clone())
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FALLBACK: &str = "Sorry, could you repeat that?";

    fn client(generator: MockReplyGenerator) -> ReplyClient {
        ReplyClient::new(Arc::new(generator), FALLBACK, Duration::from_secs(15))
    }

    #[tokio::test]
    async fn test_reply_passes_generator_text_through() {
        let generator = MockReplyGenerator::new().with_response("Happy to help!");
        let reply = client(generator.clone()).reply("hello").await;

        assert_eq!(reply.text, "Happy to help!");
        assert_eq!(reply.transcript, "hello");
        assert!(!reply.is_fallback);
        assert_eq!(generator.prompts(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn test_failure_yields_fallback() {
        let reply = client(MockReplyGenerator::new().with_failure())
            .reply("hello")
            .await;

        assert_eq!(reply.text, FALLBACK);
        assert!(reply.is_fallback);
    }

    #[tokio::test]
    async fn test_empty_reply_yields_fallback() {
        let reply = client(MockReplyGenerator::new().with_response("  "))
            .reply("hello")
            .await;
        assert!(reply.is_fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_yields_fallback() {
        let generator = MockReplyGenerator::new().with_delay(Duration::from_secs(60));
        let started = tokio::time::Instant::now();
        let reply = client(generator).reply("hello").await;

        assert!(reply.is_fallback);
        assert_eq!(started.elapsed(), Duration::from_secs(15));
    }

    #[test]
    fn test_from_config_uses_configured_fallback() {
        let config = ReplyConfig {
            fallback: "One moment please.".to_string(),
            ..ReplyConfig::default()
        };
        let client = ReplyClient::from_config(Arc::new(MockReplyGenerator::new()), &config);
        assert!(format!("{client:?}").contains("One moment please."));
        assert_eq!(client.generator_name(), "mock");
    }

    #[tokio::test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "blank transcript")]
    async fn test_blank_transcript_is_rejected_in_debug_builds() {
        client(MockReplyGenerator::new()).reply("   ").await;
    }
}
