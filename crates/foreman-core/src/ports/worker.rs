//! Worker port - タスクを実行する能力の抽象化
//!
//! Role ごとの振る舞いは Worker trait の実装で表現します（実行時の型判定はしない）。
//! Worker は pool のスロットに 1:1 で結び付き、同じ role のタスク間で再利用されます。
//!
//! # 中断と再開
//! SYNC blocker で止まったワーカーのスタックは保存しません。
//! 解決後は同じ Worker の `execute()` に、回答を追記した `WorkContext` を渡して
//! もう一度入り直します。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::domain::{BlockerId, Outcome, Role, Task, WorkerId};

/// An answered blocker, as seen by the worker that asked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockerAnswer {
    pub blocker_id: BlockerId,
    pub question: String,
    pub answer: String,
}

/// Working context carried across executions of one task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkContext {
    pub answers: Vec<BlockerAnswer>,
}

impl WorkContext {
    pub fn push_answer(&mut self, answer: BlockerAnswer) {
        if !self.answers.iter().any(|a| a.blocker_id == answer.blocker_id) {
            self.answers.push(answer);
        }
    }

    pub fn answer_for(&self, blocker_id: BlockerId) -> Option<&str> {
        self.answers
            .iter()
            .find(|a| a.blocker_id == blocker_id)
            .map(|a| a.answer.as_str())
    }
}

/// Everything a worker gets for one execution.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub task: Task,
    pub worker_id: WorkerId,
    pub context: WorkContext,

    /// Flips to `true` when the project is stopped. Workers should reach a
    /// checkpoint and return; nothing kills them.
    pub stop: watch::Receiver<bool>,
}

impl Assignment {
    pub fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }
}

#[async_trait]
pub trait Worker: Send + Sync {
    fn role(&self) -> Role;

    async fn execute(&self, assignment: Assignment) -> Outcome;
}

/// Creates workers of one role for new pool slots.
///
/// Creation is far more expensive than reuse, so the pool only calls this when
/// no idle slot of the role exists.
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    async fn spawn(&self, worker_id: WorkerId, role: Role) -> Result<std::sync::Arc<dyn Worker>, String>;
}
