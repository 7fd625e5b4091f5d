//! Events - ドメインイベント
//!
//! Coordinator / Pool / Blocker の状態遷移はすべて DomainEvent として EventSink に流れ、
//! SyncHub が seq とサーバー時刻を付けて observer へ push します。
//!
//! # JSON 形式
//! `{"type": "task_status_changed", "seq": 12, "timestamp": "...", ...}`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::blocker::{Blocker, BlockerStatus};
use super::ids::{BlockerId, TaskId, WorkerId};
use super::role::Role;
use super::task::{FailureReason, TaskStatus};

/// DomainEvent はドメインで発生した状態遷移
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    BlockerCreated {
        blocker: Blocker,
    },
    BlockerResolved {
        blocker_id: BlockerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<TaskId>,
        answer: String,
    },
    BlockerExpired {
        blocker_id: BlockerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<TaskId>,
    },
    TaskAssigned {
        task_id: TaskId,
        worker_id: WorkerId,
    },
    TaskStatusChanged {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        blocker_id: Option<BlockerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<FailureReason>,
    },
    AgentResumed {
        worker_id: WorkerId,
        task_id: TaskId,
        blocker_id: BlockerId,
    },
    AgentCreated {
        worker_id: WorkerId,
        role: Role,
    },
    AgentRetired {
        worker_id: WorkerId,
    },
}

impl DomainEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::BlockerCreated { .. } => "blocker_created",
            DomainEvent::BlockerResolved { .. } => "blocker_resolved",
            DomainEvent::BlockerExpired { .. } => "blocker_expired",
            DomainEvent::TaskAssigned { .. } => "task_assigned",
            DomainEvent::TaskStatusChanged { .. } => "task_status_changed",
            DomainEvent::AgentResumed { .. } => "agent_resumed",
            DomainEvent::AgentCreated { .. } => "agent_created",
            DomainEvent::AgentRetired { .. } => "agent_retired",
        }
    }

    /// Status carried by blocker events, if any.
    pub fn blocker_status(&self) -> Option<BlockerStatus> {
        match self {
            DomainEvent::BlockerCreated { blocker } => Some(blocker.status),
            DomainEvent::BlockerResolved { .. } => Some(BlockerStatus::Resolved),
            DomainEvent::BlockerExpired { .. } => Some(BlockerStatus::Expired),
            _ => None,
        }
    }
}

/// A DomainEvent with its push-channel sequence number and server timestamp.
///
/// Observers order updates per entity by `(timestamp, seq)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StampedEvent {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: DomainEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamped_event_flattens_type_tag() {
        let ev = StampedEvent {
            seq: 3,
            timestamp: Utc::now(),
            event: DomainEvent::TaskAssigned {
                task_id: TaskId::from_raw(1),
                worker_id: WorkerId::from_raw(2),
            },
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "task_assigned");
        assert_eq!(json["seq"], 3);
        assert_eq!(json["task_id"], TaskId::from_raw(1).to_string());

        let back: StampedEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn kind_matches_serde_tag() {
        let ev = DomainEvent::AgentRetired {
            worker_id: WorkerId::from_raw(9),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], ev.kind());
    }
}
