//! DerivedState - observer 側の状態
//!
//! Design:
//! - エンティティごとに最後に反映した `Stamp` を持ち、それより新しい更新だけを反映する。
//!   同じ更新を何度適用しても結果は変わらない（push と poll の両方から届いてよい）。
//! - Stamp は `(seq, at)` の辞書順。snapshot / poll は取得直前の `SyncHub::last_seq()` を seq に使う。
//! - blocker の最終状態（RESOLVED / EXPIRED）は stamp に関係なく巻き戻さない。
//! - `replace` は snapshot で全体を置き換え、その stamp 以前のイベントをすべて古いものとして扱う。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    Blocker, BlockerId, BlockerStatus, BlockerType, DomainEvent, FailureReason, Role, SlotState, StampedEvent,
    Task, TaskId, TaskStatus, WorkerId, WorkerSlot,
};
use crate::ports::Snapshot;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub seq: u64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry<T> {
    pub value: T,
    pub stamp: Stamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskView {
    pub id: TaskId,
    /// Unknown until a snapshot carries the task.
    pub title: Option<String>,
    pub status: TaskStatus,
    pub blocker_id: Option<BlockerId>,
    pub assigned_worker: Option<WorkerId>,
    pub failure: Option<FailureReason>,
}

impl TaskView {
    fn unseen(id: TaskId, status: TaskStatus) -> Self {
        Self {
            id,
            title: None,
            status,
            blocker_id: None,
            assigned_worker: None,
            failure: None,
        }
    }
}

impl From<&Task> for TaskView {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            title: Some(task.title.clone()),
            status: task.status,
            blocker_id: task.blocker_id,
            assigned_worker: task.assigned_worker,
            failure: task.failure.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedBlocker {
    pub id: BlockerId,
    pub task_id: Option<TaskId>,
    /// Unknown when the first thing seen is a resolution.
    pub blocker_type: Option<BlockerType>,
    pub status: BlockerStatus,
    pub answer: Option<String>,
}

impl From<&Blocker> for ObservedBlocker {
    fn from(b: &Blocker) -> Self {
        Self {
            id: b.id,
            task_id: b.task_id,
            blocker_type: Some(b.blocker_type),
            status: b.status,
            answer: b.answer.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerView {
    pub id: WorkerId,
    pub role: Option<Role>,
    pub state: SlotState,
    pub current_task: Option<TaskId>,
}

impl From<&WorkerSlot> for WorkerView {
    fn from(slot: &WorkerSlot) -> Self {
        Self {
            id: slot.id,
            role: Some(slot.role),
            state: slot.state,
            current_task: slot.current_task,
        }
    }
}

/// An event is news only if strictly newer. A poll read after seq `n` is at
/// least as fresh as anything stamped with `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Freshness {
    Newer,
    AtLeast,
}

impl Freshness {
    fn accepts(self, stamp: Stamp, current: Stamp) -> bool {
        match self {
            Freshness::Newer => stamp > current,
            Freshness::AtLeast => stamp >= current,
        }
    }
}

/// What the observer's single consumer reconciles.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Event(StampedEvent),
    /// Full resync. `seq` is the hub's last seq read before the snapshot.
    Snapshot { snapshot: Snapshot, seq: u64 },
    /// Interval re-read of blocker rows. `seq` as for `Snapshot`.
    BlockerPoll {
        blockers: Vec<Blocker>,
        at: DateTime<Utc>,
        seq: u64,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DerivedState {
    tasks: BTreeMap<TaskId, Entry<TaskView>>,
    blockers: BTreeMap<BlockerId, Entry<ObservedBlocker>>,
    workers: BTreeMap<WorkerId, Entry<WorkerView>>,
    /// Everything at or before this stamp is already reflected.
    floor: Stamp,
    last_event_seq: u64,
    resyncs: u64,
}

impl DerivedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one update; returns whether anything changed.
    pub fn apply(&mut self, update: Update) -> bool {
        match update {
            Update::Event(event) => self.apply_event(event),
            Update::Snapshot { snapshot, seq } => {
                self.replace(snapshot, seq);
                true
            }
            Update::BlockerPoll { blockers, at, seq } => {
                let stamp = Stamp { seq, at };
                let mut changed = false;
                for blocker in &blockers {
                    changed |= self.merge_blocker(ObservedBlocker::from(blocker), stamp, Freshness::AtLeast);
                }
                changed
            }
        }
    }

    /// Swap in a full snapshot.
    pub fn replace(&mut self, snapshot: Snapshot, seq: u64) {
        let stamp = Stamp {
            seq,
            at: snapshot.taken_at,
        };
        self.tasks = snapshot
            .tasks
            .iter()
            .map(|t| {
                (
                    t.id,
                    Entry {
                        value: TaskView::from(t),
                        stamp,
                    },
                )
            })
            .collect();
        self.blockers = snapshot
            .blockers
            .iter()
            .map(|b| {
                (
                    b.id,
                    Entry {
                        value: ObservedBlocker::from(b),
                        stamp,
                    },
                )
            })
            .collect();
        self.workers = snapshot
            .workers
            .iter()
            .map(|w| {
                (
                    w.id,
                    Entry {
                        value: WorkerView::from(w),
                        stamp,
                    },
                )
            })
            .collect();
        self.floor = stamp;
        self.last_event_seq = self.last_event_seq.max(seq);
        self.resyncs += 1;
    }

    // ========================================
    // Queries
    // ========================================

    pub fn task(&self, id: TaskId) -> Option<&TaskView> {
        self.tasks.get(&id).map(|e| &e.value)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskView> {
        self.tasks.values().map(|e| &e.value)
    }

    pub fn blocker(&self, id: BlockerId) -> Option<&ObservedBlocker> {
        self.blockers.get(&id).map(|e| &e.value)
    }

    pub fn pending_blockers(&self) -> Vec<&ObservedBlocker> {
        self.blockers
            .values()
            .map(|e| &e.value)
            .filter(|b| b.status == BlockerStatus::Pending)
            .collect()
    }

    pub fn worker(&self, id: WorkerId) -> Option<&WorkerView> {
        self.workers.get(&id).map(|e| &e.value)
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerView> {
        self.workers.values().map(|e| &e.value)
    }

    /// Highest event seq reflected so far.
    pub fn last_seq(&self) -> u64 {
        self.last_event_seq
    }

    /// Number of full snapshots applied.
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    // ========================================
    // Events
    // ========================================

    fn apply_event(&mut self, stamped: StampedEvent) -> bool {
        let stamp = Stamp {
            seq: stamped.seq,
            at: stamped.timestamp,
        };
        if stamp <= self.floor {
            return false;
        }
        let changed = match stamped.event {
            DomainEvent::BlockerCreated { blocker } => {
                self.merge_blocker(ObservedBlocker::from(&blocker), stamp, Freshness::Newer)
            }
            DomainEvent::BlockerResolved {
                blocker_id,
                task_id,
                answer,
            } => {
                let blocker_type = self.blocker(blocker_id).and_then(|b| b.blocker_type);
                self.merge_blocker(
                    ObservedBlocker {
                        id: blocker_id,
                        task_id,
                        blocker_type,
                        status: BlockerStatus::Resolved,
                        answer: Some(answer),
                    },
                    stamp,
                    Freshness::Newer,
                )
            }
            DomainEvent::BlockerExpired { blocker_id, task_id } => {
                let blocker_type = self.blocker(blocker_id).and_then(|b| b.blocker_type);
                self.merge_blocker(
                    ObservedBlocker {
                        id: blocker_id,
                        task_id,
                        blocker_type,
                        status: BlockerStatus::Expired,
                        answer: None,
                    },
                    stamp,
                    Freshness::Newer,
                )
            }
            DomainEvent::TaskStatusChanged {
                task_id,
                from,
                to,
                blocker_id,
                failure,
            } => {
                let changed = self.update_task(task_id, to, stamp, |view| {
                    view.status = to;
                    view.blocker_id = blocker_id;
                    if failure.is_some() {
                        view.failure = failure;
                    }
                    if !matches!(to, TaskStatus::InProgress | TaskStatus::Paused) {
                        view.assigned_worker = None;
                    }
                });
                if changed && from == TaskStatus::InProgress {
                    self.release_worker_of(task_id, to, stamp);
                }
                changed
            }
            DomainEvent::TaskAssigned { task_id, worker_id } => {
                let task = self.update_task(task_id, TaskStatus::InProgress, stamp, |view| {
                    view.assigned_worker = Some(worker_id);
                });
                let worker = self.update_worker(worker_id, stamp, |view| {
                    view.state = SlotState::Busy;
                    view.current_task = Some(task_id);
                });
                task || worker
            }
            DomainEvent::AgentResumed { worker_id, task_id, .. } => self.update_worker(worker_id, stamp, |view| {
                view.state = SlotState::Busy;
                view.current_task = Some(task_id);
            }),
            DomainEvent::AgentCreated { worker_id, role } => self.update_worker(worker_id, stamp, |view| {
                view.role = Some(role);
                view.state = SlotState::Idle;
                view.current_task = None;
            }),
            DomainEvent::AgentRetired { worker_id } => self.update_worker(worker_id, stamp, |view| {
                view.state = SlotState::Retired;
                view.current_task = None;
            }),
        };
        self.last_event_seq = self.last_event_seq.max(stamped.seq);
        changed
    }

    fn update_task(&mut self, id: TaskId, status: TaskStatus, stamp: Stamp, f: impl FnOnce(&mut TaskView)) -> bool {
        let floor = self.floor;
        let entry = self.tasks.entry(id).or_insert_with(|| Entry {
            value: TaskView::unseen(id, status),
            stamp: floor,
        });
        if stamp <= entry.stamp {
            return false;
        }
        f(&mut entry.value);
        entry.stamp = stamp;
        true
    }

    fn update_worker(&mut self, id: WorkerId, stamp: Stamp, f: impl FnOnce(&mut WorkerView)) -> bool {
        let floor = self.floor;
        let entry = self.workers.entry(id).or_insert_with(|| Entry {
            value: WorkerView {
                id,
                role: None,
                state: SlotState::Idle,
                current_task: None,
            },
            stamp: floor,
        });
        if stamp <= entry.stamp {
            return false;
        }
        f(&mut entry.value);
        entry.stamp = stamp;
        true
    }

    /// The worker running `task_id` stops being busy once the task leaves
    /// `in_progress`: it holds its slot on a pause, otherwise goes idle.
    fn release_worker_of(&mut self, task_id: TaskId, to: TaskStatus, stamp: Stamp) {
        let holder = self
            .workers
            .values()
            .find(|e| e.value.current_task == Some(task_id) && e.value.state == SlotState::Busy)
            .map(|e| e.value.id);
        if let Some(worker_id) = holder {
            self.update_worker(worker_id, stamp, |view| {
                if to == TaskStatus::Paused {
                    view.state = SlotState::Blocked;
                } else {
                    view.state = SlotState::Idle;
                    view.current_task = None;
                }
            });
        }
    }

    fn merge_blocker(&mut self, incoming: ObservedBlocker, stamp: Stamp, freshness: Freshness) -> bool {
        match self.blockers.get_mut(&incoming.id) {
            None => {
                if !freshness.accepts(stamp, self.floor) {
                    return false;
                }
                self.blockers.insert(
                    incoming.id,
                    Entry {
                        value: incoming,
                        stamp,
                    },
                );
                true
            }
            Some(entry) => {
                if !freshness.accepts(stamp, entry.stamp) {
                    return false;
                }
                let current = &entry.value;
                if current.status.is_final() && incoming.status != current.status {
                    return false;
                }
                let merged = ObservedBlocker {
                    blocker_type: incoming.blocker_type.or(current.blocker_type),
                    task_id: incoming.task_id.or(current.task_id),
                    ..incoming
                };
                let changed = merged != entry.value;
                entry.value = merged;
                entry.stamp = stamp;
                changed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::domain::ProjectId;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn event(seq: u64, event: DomainEvent) -> Update {
        Update::Event(StampedEvent {
            seq,
            timestamp: at(seq as i64),
            event,
        })
    }

    fn status(task: u128, from: TaskStatus, to: TaskStatus) -> DomainEvent {
        DomainEvent::TaskStatusChanged {
            task_id: TaskId::from_raw(task),
            from,
            to,
            blocker_id: None,
            failure: None,
        }
    }

    fn blocker(id: u128, status: BlockerStatus) -> Blocker {
        let mut b = Blocker::new(
            BlockerId::from_raw(id),
            WorkerId::from_raw(1),
            Some(TaskId::from_raw(1)),
            BlockerType::Sync,
            "which db?",
            at(0),
        );
        b.status = status;
        if status == BlockerStatus::Resolved {
            b.answer = Some("postgres".into());
        }
        b
    }

    #[test]
    fn stale_event_is_ignored() {
        let mut state = DerivedState::new();
        assert!(state.apply(event(2, status(1, TaskStatus::Ready, TaskStatus::InProgress))));
        assert!(!state.apply(event(1, status(1, TaskStatus::Pending, TaskStatus::Ready))));
        assert_eq!(state.task(TaskId::from_raw(1)).unwrap().status, TaskStatus::InProgress);
    }

    #[test]
    fn reapplying_an_event_is_a_noop() {
        let mut state = DerivedState::new();
        let update = event(1, status(1, TaskStatus::Pending, TaskStatus::Ready));
        assert!(state.apply(update.clone()));
        let before = state.clone();
        assert!(!state.apply(update));
        assert_eq!(state, before);
    }

    #[test]
    fn final_blocker_status_never_regresses() {
        let mut state = DerivedState::new();
        let id = BlockerId::from_raw(9);
        state.apply(event(
            2,
            DomainEvent::BlockerResolved {
                blocker_id: id,
                task_id: None,
                answer: "yes".into(),
            },
        ));
        // a newer-stamped poll that read the row before the resolution landed
        let changed = state.apply(Update::BlockerPoll {
            blockers: vec![blocker(9, BlockerStatus::Pending)],
            at: at(10),
            seq: 5,
        });
        assert!(!changed);
        assert_eq!(state.blocker(id).unwrap().status, BlockerStatus::Resolved);
        assert_eq!(state.blocker(id).unwrap().answer.as_deref(), Some("yes"));
    }

    #[test]
    fn poll_fills_in_missed_resolution() {
        let mut state = DerivedState::new();
        state.apply(event(
            1,
            DomainEvent::BlockerCreated {
                blocker: blocker(9, BlockerStatus::Pending),
            },
        ));
        assert_eq!(state.pending_blockers().len(), 1);

        assert!(state.apply(Update::BlockerPoll {
            blockers: vec![blocker(9, BlockerStatus::Resolved)],
            at: at(5),
            seq: 3,
        }));
        let seen = state.blocker(BlockerId::from_raw(9)).unwrap();
        assert_eq!(seen.status, BlockerStatus::Resolved);
        assert_eq!(seen.blocker_type, Some(BlockerType::Sync));
        assert!(state.pending_blockers().is_empty());
    }

    #[test]
    fn snapshot_replaces_state_and_rejects_older_events() {
        let mut state = DerivedState::new();
        state.apply(event(1, status(7, TaskStatus::Pending, TaskStatus::Ready)));

        let task = Task::new(TaskId::from_raw(1), "api", Role::Backend, [], at(0));
        let snapshot = Snapshot {
            project_id: ProjectId::from_raw(1),
            tasks: vec![task],
            blockers: vec![],
            workers: vec![WorkerSlot::new(WorkerId::from_raw(3), Role::Backend)],
            taken_at: at(20),
        };
        state.replace(snapshot, 4);

        assert!(state.task(TaskId::from_raw(7)).is_none());
        assert_eq!(state.task(TaskId::from_raw(1)).unwrap().title.as_deref(), Some("api"));
        assert_eq!(state.resyncs(), 1);
        assert!(!state.apply(event(3, status(1, TaskStatus::Pending, TaskStatus::Ready))));
        assert!(state.apply(Update::Event(StampedEvent {
            seq: 5,
            timestamp: at(21),
            event: status(1, TaskStatus::Pending, TaskStatus::Ready),
        })));
        assert_eq!(state.task(TaskId::from_raw(1)).unwrap().status, TaskStatus::Ready);
    }

    #[test]
    fn worker_follows_its_task() {
        let mut state = DerivedState::new();
        let worker = WorkerId::from_raw(3);
        let task = TaskId::from_raw(1);
        state.apply(event(
            1,
            DomainEvent::AgentCreated {
                worker_id: worker,
                role: Role::Backend,
            },
        ));
        state.apply(event(2, DomainEvent::TaskAssigned { task_id: task, worker_id: worker }));
        assert_eq!(state.worker(worker).unwrap().state, SlotState::Busy);

        state.apply(event(3, status(1, TaskStatus::InProgress, TaskStatus::Paused)));
        assert_eq!(state.worker(worker).unwrap().state, SlotState::Blocked);

        state.apply(event(
            4,
            DomainEvent::AgentResumed {
                worker_id: worker,
                task_id: task,
                blocker_id: BlockerId::from_raw(9),
            },
        ));
        state.apply(event(5, status(1, TaskStatus::InProgress, TaskStatus::Completed)));
        let view = state.worker(worker).unwrap();
        assert_eq!(view.state, SlotState::Idle);
        assert_eq!(view.current_task, None);
        assert_eq!(state.last_seq(), 5);
    }
}
