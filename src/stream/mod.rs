//! Inbound media stream handling.
//!
//! ```text
//! socket text ──▶ FrameDecoder ──▶ InboundEvent ──▶ session
//!                                     │
//!                                     └─ Media before link open ──▶ PendingAudio
//! ```

pub mod frame;
pub mod pending;

pub use frame::{AudioFrame, FrameDecoder, InboundEvent};
pub use pending::{Enqueue, PendingAudio};
