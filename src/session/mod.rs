//! Per-call orchestration.

pub mod call;
pub mod state;

pub use call::{CallSession, SessionServices, SessionSummary};
pub use state::{LinkState, SessionState};
