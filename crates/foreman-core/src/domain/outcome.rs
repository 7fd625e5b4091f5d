//! Outcome model: what a worker reports back after one execution.
//!
//! The coordinator only looks at the shape defined here; it does not care how
//! the worker reached its result.

use serde::{Deserialize, Serialize};

use super::blocker::BlockerType;

/// Serialized as SCREAMING_SNAKE_CASE: SUCCESS / FAILURE / BLOCKED / STOPPED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Success,
    Failure,
    Blocked,
    /// The worker saw the stop signal and left at a checkpoint.
    Stopped,
}

/// The question a worker wants answered before it can continue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockerRequest {
    pub blocker_type: BlockerType,
    pub question: String,
}

/// Result of one `Worker::execute` call.
///
/// - `SUCCESS`: the task is done.
/// - `FAILURE`: recoverable failure, the decider picks retry or give-up.
/// - `BLOCKED`: cannot proceed without a human answer.
/// - `STOPPED`: interrupted by the stop signal; not a failure and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub kind: OutcomeKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocker: Option<BlockerRequest>,

    /// Last reported progress (0..=100).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
}

impl Outcome {
    pub fn success() -> Self {
        Self {
            kind: OutcomeKind::Success,
            reason: None,
            blocker: None,
            progress: Some(100),
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            kind: OutcomeKind::Failure,
            reason: Some(reason.into()),
            blocker: None,
            progress: None,
        }
    }

    pub fn blocked(blocker_type: BlockerType, question: impl Into<String>) -> Self {
        let question = question.into();
        Self {
            kind: OutcomeKind::Blocked,
            reason: Some(question.clone()),
            blocker: Some(BlockerRequest {
                blocker_type,
                question,
            }),
            progress: None,
        }
    }

    pub fn stopped() -> Self {
        Self {
            kind: OutcomeKind::Stopped,
            reason: None,
            blocker: None,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_outcome_carries_request() {
        let outcome = Outcome::blocked(BlockerType::Sync, "which auth provider?").with_progress(40);
        assert_eq!(outcome.kind, OutcomeKind::Blocked);
        let req = outcome.blocker.unwrap();
        assert_eq!(req.blocker_type, BlockerType::Sync);
        assert_eq!(req.question, "which auth provider?");
        assert_eq!(outcome.progress, Some(40));
    }

    #[test]
    fn kind_serializes_screaming_snake_case() {
        let json = serde_json::to_value(Outcome::failure("boom")).unwrap();
        assert_eq!(json["kind"], "FAILURE");
        assert_eq!(json["reason"], "boom");
        assert_eq!(serde_json::to_value(Outcome::stopped()).unwrap()["kind"], "STOPPED");
    }
}
