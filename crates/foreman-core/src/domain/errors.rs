//! Errors - エラー型
//!
//! 関心ごとに enum を分け、呼び出し側へ返すものだけを Err にします。
//! - GraphError: グラフ変更の拒否（部分適用なし）
//! - PoolError: スロット操作。PoolExhausted はスケジューリングサイクル内で吸収される
//! - BlockerError: 入力検証・レート制限・未知の ID
//! - ConfigError: 設定ファイル
//!
//! AlreadyResolved は想定内の競合結果なのでエラーではなく `ResolveOutcome` で返します。
//! RetryExceeded / BlockerExpired は `FailureReason` としてイベントで通知します。

use thiserror::Error;

use super::ids::{BlockerId, TaskId, WorkerId};
use super::role::Role;
use super::slot::SlotState;
use super::task::TaskStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("task {0} already exists")]
    DuplicateTask(TaskId),

    #[error("task {0} cannot depend on itself")]
    SelfDependency(TaskId),

    #[error("task {task} depends on unknown task {predecessor}")]
    UnknownPredecessor { task: TaskId, predecessor: TaskId },

    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error("dependency cycle detected: {}", render_cycle(.cycle))]
    CycleDetected { cycle: Vec<TaskId> },

    #[error("invalid transition for {task}: {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("duplicate plan key {0:?}")]
    DuplicateKey(String),

    #[error("plan entry {key:?} depends on unknown key {missing:?}")]
    UnknownKey { key: String, missing: String },
}

fn render_cycle(cycle: &[TaskId]) -> String {
    cycle
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("worker pool exhausted ({max} slots in use)")]
    PoolExhausted { max: usize },

    #[error("unknown worker slot {0}")]
    UnknownSlot(WorkerId),

    #[error("no worker factory registered for role {0}")]
    NoFactory(Role),

    #[error("duplicate worker factory for role {0}")]
    DuplicateRole(Role),

    #[error("failed to spawn {role} worker: {reason}")]
    SpawnFailed { role: Role, reason: String },

    #[error("worker slot {worker_id} is {state:?}")]
    InvalidSlotState { worker_id: WorkerId, state: SlotState },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockerError {
    #[error("question must be 1-{max} characters (got {len})")]
    InvalidQuestion { len: usize, max: usize },

    #[error("answer must be 1-{max} characters (got {len})")]
    InvalidAnswer { len: usize, max: usize },

    #[error("blocker {0} not found")]
    NotFound(BlockerId),

    #[error("rate limit exceeded: worker {worker_id} created {limit} blockers in the last minute")]
    RateLimited { worker_id: WorkerId, limit: u32 },

    #[error("blocker references unknown task {0}")]
    UnknownTask(TaskId),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// ForemanError はクレート全体の Result 用エラー
#[derive(Debug, Error)]
pub enum ForemanError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Blocker(#[from] BlockerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("coordinator is stopped")]
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_lists_path() {
        let a = TaskId::from_raw(1);
        let b = TaskId::from_raw(2);
        let err = GraphError::CycleDetected { cycle: vec![a, b, a] };
        assert_eq!(err.to_string(), format!("dependency cycle detected: {a} -> {b} -> {a}"));
    }

    #[test]
    fn from_conversions_wrap_sources() {
        let err: ForemanError = PoolError::NoFactory(Role::Test).into();
        assert!(matches!(err, ForemanError::Pool(PoolError::NoFactory(Role::Test))));
        assert_eq!(err.to_string(), "no worker factory registered for role test");
    }
}
