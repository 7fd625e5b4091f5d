//! Decision model: what to do with a task after a failed execution.
//!
//! This module defines the Decision type (what to do next), the Decider trait
//! (how to pick it) and the DecisionRecord kept as an audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::outcome::Outcome;
use super::task::Task;
use crate::blocker::classify::{FailureClass, classify_failure};

/// The next action for a task whose last execution failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Put the task back to `ready`. No backoff: the next cycle may pick it up.
    Retry { reason: String },

    /// Give up: the task becomes `failed` and its dependents `blocked`.
    MarkFailed { reason: String },

    /// Ask a human instead of burning a retry.
    Escalate { question: String },
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Retry { .. } => "retry",
            Decision::MarkFailed { .. } => "mark_failed",
            Decision::Escalate { .. } => "escalate",
        }
    }
}

/// Decides the next action from the task (retry counter already incremented)
/// and the outcome that triggered the decision.
///
/// Deciders are pure: the coordinator applies the returned Decision.
pub trait Decider: Send + Sync {
    fn decide(&self, task: &Task, outcome: &Outcome) -> Decision;

    /// Name recorded in `DecisionRecord::policy`.
    fn policy(&self) -> &'static str {
        "retry_policy"
    }
}

/// Retry limits applied by [`DefaultDecider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failures allowed before the task is marked failed (the Nth failure is terminal).
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

/// Count-based retry with optional escalation of failures that read like a
/// request for human input ("please clarify", "api key", ...).
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
    escalate_human_failures: bool,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self {
            retry_policy,
            escalate_human_failures: false,
        }
    }

    pub fn with_escalation(mut self, enabled: bool) -> Self {
        self.escalate_human_failures = enabled;
        self
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, task: &Task, outcome: &Outcome) -> Decision {
        let error = outcome.reason.clone().unwrap_or_else(|| "unknown error".to_string());

        if self.escalate_human_failures && classify_failure(&error) == FailureClass::Human {
            return Decision::Escalate {
                question: format!("Task \"{}\" needs input: {}", task.title, error),
            };
        }

        if task.retry_count >= self.retry_policy.max_retries {
            Decision::MarkFailed {
                reason: format!(
                    "Max retries reached: {}/{}",
                    task.retry_count, self.retry_policy.max_retries
                ),
            }
        } else {
            Decision::Retry {
                reason: format!(
                    "Retry {}/{} after: {}",
                    task.retry_count, self.retry_policy.max_retries, error
                ),
            }
        }
    }
}

/// A decision made during execution, kept so "why did the system do X"
/// can be answered later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub task_id: TaskId,

    /// What was observed that triggered this decision.
    pub trigger: serde_json::Value,

    /// Examples: "retry_policy", "blocker_expiry", "escalation"
    pub policy: String,

    /// Examples: "retry", "mark_failed", "escalate", "fail_on_expiry"
    pub decision: String,

    pub context: Option<serde_json::Value>,
    pub decided_at: DateTime<Utc>,
}

impl DecisionRecord {
    pub fn new(
        task_id: TaskId,
        trigger: serde_json::Value,
        policy: impl Into<String>,
        decision: impl Into<String>,
        context: Option<serde_json::Value>,
        decided_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            trigger,
            policy: policy.into(),
            decision: decision.into(),
            context,
            decided_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Role;
    use rstest::rstest;

    fn task_with_retries(retry_count: u32) -> Task {
        let mut task = Task::new(TaskId::from_raw(1), "build api", Role::Backend, [], Utc::now());
        task.retry_count = retry_count;
        task
    }

    #[rstest]
    #[case::first_failure(1, "retry")]
    #[case::second_failure(2, "retry")]
    #[case::third_failure(3, "mark_failed")]
    #[case::beyond(4, "mark_failed")]
    fn count_based_retry(#[case] retries: u32, #[case] expected: &str) {
        let decider = DefaultDecider::new(RetryPolicy::default());
        let decision = decider.decide(&task_with_retries(retries), &Outcome::failure("compile error"));
        assert_eq!(decision.label(), expected);
    }

    #[test]
    fn human_failure_escalates_only_when_enabled() {
        let outcome = Outcome::failure("Authentication required: missing API key");
        let task = task_with_retries(1);

        let plain = DefaultDecider::new(RetryPolicy::default());
        assert_eq!(plain.decide(&task, &outcome).label(), "retry");

        let escalating = DefaultDecider::new(RetryPolicy::default()).with_escalation(true);
        match escalating.decide(&task, &outcome) {
            Decision::Escalate { question } => assert!(question.contains("API key")),
            other => panic!("expected escalation, got {other:?}"),
        }
    }

    #[test]
    fn technical_failure_never_escalates() {
        let decider = DefaultDecider::new(RetryPolicy::default()).with_escalation(true);
        let decision = decider.decide(&task_with_retries(1), &Outcome::failure("SyntaxError: bad token"));
        assert_eq!(decision.label(), "retry");
    }
}
