//! Scripted workers for demos and tests.
//!
//! Behavior is looked up by task title: fail N times, optionally ask one
//! question first, then succeed. State is shared across every worker the
//! factory creates, so a retried task continues its script on another slot.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::domain::{BlockerType, Outcome, Role, TaskId, WorkerId};
use crate::ports::{Assignment, WorkContext, Worker, WorkerFactory};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptedQuestion {
    #[serde(rename = "type")]
    pub blocker_type: BlockerType,
    pub question: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    /// Failures reported before the first success.
    #[serde(default)]
    pub fail_times: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_message: Option<String>,

    /// Asked once, on the first execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<ScriptedQuestion>,

    /// Simulated work per execution.
    #[serde(default)]
    pub work_ms: u64,
}

/// One `execute` call as seen by a scripted worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionLog {
    pub worker_id: WorkerId,
    pub task_id: TaskId,
    pub context: WorkContext,
}

#[derive(Debug, Default)]
struct TaskProgress {
    failures: u32,
    asked: bool,
}

#[derive(Default)]
struct Shared {
    scripts: HashMap<String, Script>,
    progress: Mutex<HashMap<TaskId, TaskProgress>>,
    log: Mutex<Vec<ExecutionLog>>,
    spawned: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct ScriptedWorkerFactory {
    shared: Arc<Shared>,
}

impl ScriptedWorkerFactory {
    pub fn new(scripts: HashMap<String, Script>) -> Self {
        Self {
            shared: Arc::new(Shared {
                scripts,
                ..Shared::default()
            }),
        }
    }

    /// Number of workers created so far.
    pub fn spawned(&self) -> usize {
        self.shared.spawned.load(Ordering::SeqCst)
    }

    pub async fn executions(&self) -> Vec<ExecutionLog> {
        self.shared.log.lock().await.clone()
    }
}

#[async_trait]
impl WorkerFactory for ScriptedWorkerFactory {
    async fn spawn(&self, worker_id: WorkerId, role: Role) -> Result<Arc<dyn Worker>, String> {
        self.shared.spawned.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedWorker {
            worker_id,
            role,
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct ScriptedWorker {
    worker_id: WorkerId,
    role: Role,
    shared: Arc<Shared>,
}

#[async_trait]
impl Worker for ScriptedWorker {
    fn role(&self) -> Role {
        self.role
    }

    async fn execute(&self, mut assignment: Assignment) -> Outcome {
        let task = &assignment.task;
        let script = self.shared.scripts.get(&task.title).cloned().unwrap_or_default();

        self.shared.log.lock().await.push(ExecutionLog {
            worker_id: self.worker_id,
            task_id: task.id,
            context: assignment.context.clone(),
        });

        if script.work_ms > 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(script.work_ms)) => {}
                _ = assignment.stop.wait_for(|stop| *stop) => {
                    return Outcome::stopped();
                }
            }
        }

        let mut progress = self.shared.progress.lock().await;
        let entry = progress.entry(assignment.task.id).or_default();

        if let Some(ask) = &script.ask
            && !entry.asked
        {
            entry.asked = true;
            return Outcome::blocked(ask.blocker_type, ask.question.clone()).with_progress(50);
        }

        if entry.failures < script.fail_times {
            entry.failures += 1;
            let message = script
                .fail_message
                .clone()
                .unwrap_or_else(|| format!("scripted failure {}/{}", entry.failures, script.fail_times));
            return Outcome::failure(message);
        }

        Outcome::success()
    }
}
