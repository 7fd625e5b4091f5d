//! Worker slot model (owned by the pool).

use serde::{Deserialize, Serialize};

use super::ids::{BlockerId, TaskId, WorkerId};
use super::role::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Idle,
    Busy,
    /// Held by a worker suspended on a SYNC blocker.
    Blocked,
    Retired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSlot {
    pub id: WorkerId,
    pub role: Role,
    pub state: SlotState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<TaskId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<BlockerId>,

    pub tasks_completed: u32,
}

impl WorkerSlot {
    pub fn new(id: WorkerId, role: Role) -> Self {
        Self {
            id,
            role,
            state: SlotState::Idle,
            current_task: None,
            blocked_by: None,
            tasks_completed: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == SlotState::Idle
    }
}
