//! Blocker record: a worker's request for human input.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{BlockerId, TaskId, WorkerId};

/// SYNC pauses the task and everything downstream of it.
/// ASYNC only deprioritizes the asking task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockerType {
    Sync,
    Async,
}

impl std::fmt::Display for BlockerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BlockerType::Sync => "SYNC",
            BlockerType::Async => "ASYNC",
        })
    }
}

/// Monotonic: PENDING -> RESOLVED or PENDING -> EXPIRED, nothing leaves a final state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockerStatus {
    Pending,
    Resolved,
    Expired,
}

impl BlockerStatus {
    pub fn is_final(self) -> bool {
        !matches!(self, BlockerStatus::Pending)
    }
}

impl std::fmt::Display for BlockerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BlockerStatus::Pending => "PENDING",
            BlockerStatus::Resolved => "RESOLVED",
            BlockerStatus::Expired => "EXPIRED",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blocker {
    pub id: BlockerId,
    pub worker_id: WorkerId,

    /// None for agent-level blockers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,

    pub blocker_type: BlockerType,
    pub question: String,

    /// Present iff `status == Resolved`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,

    pub status: BlockerStatus,
    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Blocker {
    pub fn new(
        id: BlockerId,
        worker_id: WorkerId,
        task_id: Option<TaskId>,
        blocker_type: BlockerType,
        question: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            worker_id,
            task_id,
            blocker_type,
            question: question.into(),
            answer: None,
            status: BlockerStatus::Pending,
            created_at,
            resolved_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == BlockerStatus::Pending
    }

    /// PENDING -> RESOLVED. Returns false (and changes nothing) otherwise.
    pub fn resolve(&mut self, answer: impl Into<String>, at: DateTime<Utc>) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.status = BlockerStatus::Resolved;
        self.answer = Some(answer.into());
        self.resolved_at = Some(at);
        true
    }

    /// PENDING -> EXPIRED. Returns false (and changes nothing) otherwise.
    pub fn expire(&mut self, at: DateTime<Utc>) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.status = BlockerStatus::Expired;
        self.resolved_at = Some(at);
        true
    }

    /// Milliseconds between creation and `now` (or resolution, once final).
    pub fn waiting_ms(&self, now: DateTime<Utc>) -> i64 {
        let end = self.resolved_at.unwrap_or(now);
        (end - self.created_at).num_milliseconds().max(0)
    }
}
