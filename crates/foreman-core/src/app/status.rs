//! Status - プロジェクトの現在地と詰まり理由
//!
//! タスク数（状態別）・プールの占有・blocker の集計に加えて、
//! 「どのタスクが何を待っているか」をまとめて返します。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::blocker::BlockerStats;
use crate::coordinator::Coordinator;
use crate::domain::{ProjectId, TaskId};
use crate::graph::TaskCounts;
use crate::pool::PoolOccupancy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub project_id: ProjectId,
    pub tasks: TaskCounts,
    pub pool: PoolOccupancy,
    pub blockers: BlockerStats,
    /// Workers holding a slot while they wait on a SYNC blocker.
    pub suspended: usize,
    pub in_flight: usize,
    /// Unfinished task -> predecessors it is still waiting on.
    pub waiting_on: BTreeMap<TaskId, Vec<TaskId>>,
}

impl StatusReport {
    pub async fn collect(coordinator: &Coordinator) -> Self {
        let (tasks, pool, blockers, suspended, waiting_on) = tokio::join!(
            coordinator.counts(),
            coordinator.occupancy(),
            coordinator.blockers().stats(),
            coordinator.suspended(),
            coordinator.waiting_on(),
        );
        Self {
            project_id: coordinator.project_id(),
            tasks,
            pool,
            blockers,
            suspended: suspended.len(),
            in_flight: coordinator.in_flight(),
            waiting_on,
        }
    }

    /// Nothing can make progress without a human (or everything is done).
    pub fn is_settled(&self) -> bool {
        self.tasks.is_settled() && self.in_flight == 0
    }
}
