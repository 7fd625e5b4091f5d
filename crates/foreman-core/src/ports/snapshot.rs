//! SnapshotSource port - observer が full resync / poll で読む現在状態

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Blocker, ProjectId, Task, WorkerSlot};

/// Point-in-time copy of every entity an observer derives state from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub project_id: ProjectId,
    pub tasks: Vec<Task>,
    pub blockers: Vec<Blocker>,
    pub workers: Vec<WorkerSlot>,
    pub taken_at: DateTime<Utc>,
}

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Full state, used on connect and after a dropped push channel.
    async fn snapshot(&self) -> Snapshot;

    /// Blocker rows only, used by the interval poll.
    async fn blockers(&self) -> (Vec<Blocker>, DateTime<Utc>);
}
