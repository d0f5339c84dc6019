//! Reply generation for recognized utterances.
//!
//! Each accepted transcript becomes one fire-and-forget task:
//! `ReplyClient::reply` (with timeout and fallback) then `ReplySink::deliver`.

pub mod generator;
pub mod openai;
pub mod sink;

pub use generator::{GeneratedReply, MockReplyGenerator, ReplyClient, ReplyGenerator};
pub use openai::OpenAiReplyGenerator;
pub use sink::{CollectorSink, LogSink, ReplySink, StdoutSink};
