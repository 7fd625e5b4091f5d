//! Blocker subsystem: human-in-the-loop questions raised by workers.

pub mod classify;
pub mod service;

pub use classify::{FailureClass, classify_failure, is_tactical, should_escalate};
pub use service::{BlockerLimits, BlockerService, BlockerStats, BlockerView, ResolveOutcome, WaitOutcome};
