//! Task record and its status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{BlockerId, TaskId, WorkerId};
use super::role::Role;

/// Task status.
///
/// State transitions:
/// - Pending -> Ready (every predecessor completed)
/// - Ready -> InProgress -> Completed
/// - InProgress -> Ready (retry, or ASYNC blocker raised)
/// - InProgress -> Failed (retries exceeded)
/// - {Pending, Ready, InProgress, Blocked} -> Paused (SYNC blocker) -> Pending | InProgress (resume)
/// - {Pending, Ready, Paused} -> Blocked (predecessor failed)
/// - Failed -> Pending (manual restart)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    InProgress,
    Paused,
    Blocked,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Completed and failed tasks are never touched by pause/block propagation.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        if self == next {
            return false;
        }
        match next {
            Pending => matches!(self, Ready | InProgress | Paused | Blocked | Failed),
            Ready => matches!(self, Pending | InProgress | Blocked),
            InProgress => matches!(self, Ready | Paused),
            Paused => matches!(self, Pending | Ready | InProgress | Blocked),
            Blocked => matches!(self, Pending | Ready | Paused),
            Completed => self == InProgress,
            Failed => matches!(self, Pending | Ready | InProgress | Paused | Blocked),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Paused => "paused",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task ended up `failed`. Pushed to observers; never an `Err`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    RetryExceeded {
        attempts: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_error: Option<String>,
    },
    BlockerExpired {
        blocker_id: BlockerId,
    },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::RetryExceeded { attempts, .. } => {
                write!(f, "retry limit exceeded after {attempts} attempts")
            }
            FailureReason::BlockerExpired { blocker_id } => {
                write!(f, "blocker expired: {blocker_id}")
            }
        }
    }
}

/// A unit of work in the dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub role: Role,
    pub status: TaskStatus,

    /// Predecessors, in declaration order, without duplicates.
    pub depends_on: Vec<TaskId>,

    /// Set only while `status == Paused`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocker_id: Option<BlockerId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_worker: Option<WorkerId>,

    /// 0..=100
    pub progress: u8,
    pub retry_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        id: TaskId,
        title: impl Into<String>,
        role: Role,
        depends_on: impl IntoIterator<Item = TaskId>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut deps: Vec<TaskId> = Vec::new();
        for dep in depends_on {
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }
        Self {
            id,
            title: title.into(),
            role,
            status: TaskStatus::Pending,
            depends_on: deps,
            blocker_id: None,
            assigned_worker: None,
            progress: 0,
            retry_count: 0,
            failure: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_progress(&mut self, progress: u8) {
        self.progress = progress.min(100);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use TaskStatus::*;

    #[rstest]
    #[case::promote(Pending, Ready, true)]
    #[case::assign(Ready, InProgress, true)]
    #[case::complete(InProgress, Completed, true)]
    #[case::retry(InProgress, Ready, true)]
    #[case::pause_running(InProgress, Paused, true)]
    #[case::resume_in_place(Paused, InProgress, true)]
    #[case::resume_to_pending(Paused, Pending, true)]
    #[case::restart(Failed, Pending, true)]
    #[case::skip_ready(Pending, InProgress, false)]
    #[case::complete_unstarted(Ready, Completed, false)]
    #[case::reopen_completed(Completed, Pending, false)]
    #[case::pause_completed(Completed, Paused, false)]
    #[case::pause_failed(Failed, Paused, false)]
    #[case::same(Ready, Ready, false)]
    fn transition_matrix(#[case] from: TaskStatus, #[case] to: TaskStatus, #[case] ok: bool) {
        assert_eq!(from.can_transition_to(to), ok);
    }

    #[test]
    fn new_task_dedups_predecessors_keeping_order() {
        let a = TaskId::from_raw(1);
        let b = TaskId::from_raw(2);
        let task = Task::new(TaskId::from_raw(3), "c", Role::Backend, [b, a, b], Utc::now());
        assert_eq!(task.depends_on, vec![b, a]);
        assert_eq!(task.status, Pending);
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&InProgress).unwrap(), "\"in_progress\"");
    }

    #[test]
    fn progress_is_clamped() {
        let mut task = Task::new(TaskId::from_raw(1), "a", Role::Test, [], Utc::now());
        task.set_progress(250);
        assert_eq!(task.progress, 100);
    }
}
