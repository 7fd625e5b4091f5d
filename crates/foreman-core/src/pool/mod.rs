//! Worker pool: a bounded set of role-bound worker slots.
//!
//! Design:
//! - Reuse before create: `acquire` hands out an idle slot of the role (lowest
//!   id first) and only asks the role's factory for a new worker when none is
//!   idle and the pool is below `max_slots`.
//! - One mutex per pool guards every slot transition. The lock is held across
//!   the factory call so two acquires can never overshoot `max_slots`.
//! - Retired slots leave the pool for good and free their capacity.

pub mod registry;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::domain::{BlockerId, DomainEvent, PoolError, Role, SlotState, TaskId, WorkerId, WorkerSlot};
use crate::ports::{EventSink, IdGenerator, Worker};

pub use registry::FactoryRegistry;

/// A slot handed out by `acquire`, already marked busy with the task.
#[derive(Clone)]
pub struct AcquiredSlot {
    pub worker_id: WorkerId,
    pub worker: Arc<dyn Worker>,
    pub reused: bool,
}

impl std::fmt::Debug for AcquiredSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquiredSlot")
            .field("worker_id", &self.worker_id)
            .field("reused", &self.reused)
            .finish()
    }
}

/// Slot counts by state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolOccupancy {
    pub idle: usize,
    pub busy: usize,
    pub blocked: usize,
    pub retired: usize,
    pub max_slots: usize,
}

struct SlotEntry {
    slot: WorkerSlot,
    worker: Arc<dyn Worker>,
}

#[derive(Default)]
struct PoolState {
    slots: BTreeMap<WorkerId, SlotEntry>,
    retired: Vec<WorkerSlot>,
}

impl PoolState {
    fn entry_mut(&mut self, worker_id: WorkerId) -> Result<&mut SlotEntry, PoolError> {
        self.slots
            .get_mut(&worker_id)
            .ok_or(PoolError::UnknownSlot(worker_id))
    }
}

pub struct WorkerPool {
    state: Mutex<PoolState>,
    registry: Arc<FactoryRegistry>,
    max_slots: usize,
    ids: Arc<dyn IdGenerator>,
    events: Arc<dyn EventSink>,
}

impl WorkerPool {
    pub fn new(
        registry: Arc<FactoryRegistry>,
        max_slots: usize,
        ids: Arc<dyn IdGenerator>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            registry,
            max_slots,
            ids,
            events,
        }
    }

    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    pub fn registry(&self) -> &FactoryRegistry {
        &self.registry
    }

    /// Get a busy slot of `role` for `task_id`: an idle one if any, else a new
    /// one while below `max_slots`, else `PoolExhausted`.
    pub async fn acquire(&self, role: Role, task_id: TaskId) -> Result<AcquiredSlot, PoolError> {
        let mut state = self.state.lock().await;

        if let Some(entry) = state
            .slots
            .values_mut()
            .find(|e| e.slot.role == role && e.slot.is_idle())
        {
            entry.slot.state = SlotState::Busy;
            entry.slot.current_task = Some(task_id);
            debug!(worker_id = %entry.slot.id, %role, %task_id, "reusing idle worker");
            return Ok(AcquiredSlot {
                worker_id: entry.slot.id,
                worker: Arc::clone(&entry.worker),
                reused: true,
            });
        }

        if state.slots.len() >= self.max_slots {
            return Err(PoolError::PoolExhausted { max: self.max_slots });
        }

        let factory = self.registry.get(role).ok_or(PoolError::NoFactory(role))?;
        let worker_id = self.ids.generate_worker_id();
        let worker = factory
            .spawn(worker_id, role)
            .await
            .map_err(|reason| PoolError::SpawnFailed { role, reason })?;

        let mut slot = WorkerSlot::new(worker_id, role);
        slot.state = SlotState::Busy;
        slot.current_task = Some(task_id);
        state.slots.insert(
            worker_id,
            SlotEntry {
                slot,
                worker: Arc::clone(&worker),
            },
        );
        info!(%worker_id, %role, slots = state.slots.len(), "created worker");
        self.events.emit(DomainEvent::AgentCreated { worker_id, role });

        Ok(AcquiredSlot {
            worker_id,
            worker,
            reused: false,
        })
    }

    /// Back to idle (not retired) so a later `acquire` can reuse it.
    pub async fn release(&self, worker_id: WorkerId) -> Result<(), PoolError> {
        let mut state = self.state.lock().await;
        let entry = state.entry_mut(worker_id)?;
        entry.slot.state = SlotState::Idle;
        entry.slot.current_task = None;
        entry.slot.blocked_by = None;
        Ok(())
    }

    /// Release after a successful task and bump the completion counter.
    pub async fn complete(&self, worker_id: WorkerId) -> Result<(), PoolError> {
        let mut state = self.state.lock().await;
        let entry = state.entry_mut(worker_id)?;
        entry.slot.tasks_completed += 1;
        entry.slot.state = SlotState::Idle;
        entry.slot.current_task = None;
        entry.slot.blocked_by = None;
        Ok(())
    }

    /// Busy -> blocked: the worker is suspended on a SYNC blocker and keeps its slot.
    pub async fn mark_blocked(&self, worker_id: WorkerId, blocker_id: BlockerId) -> Result<(), PoolError> {
        let mut state = self.state.lock().await;
        let entry = state.entry_mut(worker_id)?;
        if entry.slot.state != SlotState::Busy {
            return Err(PoolError::InvalidSlotState {
                worker_id,
                state: entry.slot.state,
            });
        }
        entry.slot.state = SlotState::Blocked;
        entry.slot.blocked_by = Some(blocker_id);
        Ok(())
    }

    /// Blocked -> busy on `task_id`; returns the worker to re-enter.
    pub async fn resume(&self, worker_id: WorkerId, task_id: TaskId) -> Result<Arc<dyn Worker>, PoolError> {
        let mut state = self.state.lock().await;
        let entry = state.entry_mut(worker_id)?;
        if entry.slot.state != SlotState::Blocked {
            return Err(PoolError::InvalidSlotState {
                worker_id,
                state: entry.slot.state,
            });
        }
        entry.slot.state = SlotState::Busy;
        entry.slot.current_task = Some(task_id);
        entry.slot.blocked_by = None;
        Ok(Arc::clone(&entry.worker))
    }

    /// Remove the slot permanently (unrecoverable worker failure).
    pub async fn retire(&self, worker_id: WorkerId) -> Result<(), PoolError> {
        let mut state = self.state.lock().await;
        let mut entry = state
            .slots
            .remove(&worker_id)
            .ok_or(PoolError::UnknownSlot(worker_id))?;
        entry.slot.state = SlotState::Retired;
        entry.slot.current_task = None;
        entry.slot.blocked_by = None;
        state.retired.push(entry.slot);
        info!(%worker_id, "retired worker");
        self.events.emit(DomainEvent::AgentRetired { worker_id });
        Ok(())
    }

    /// Every live slot back to idle (project stop). Returns how many were held.
    pub async fn release_all(&self) -> usize {
        let mut state = self.state.lock().await;
        let mut released = 0;
        for entry in state.slots.values_mut() {
            if !entry.slot.is_idle() {
                released += 1;
            }
            entry.slot.state = SlotState::Idle;
            entry.slot.current_task = None;
            entry.slot.blocked_by = None;
        }
        released
    }

    pub async fn slot(&self, worker_id: WorkerId) -> Option<WorkerSlot> {
        let state = self.state.lock().await;
        state.slots.get(&worker_id).map(|e| e.slot.clone())
    }

    /// Live slots, sorted by id.
    pub async fn status(&self) -> Vec<WorkerSlot> {
        let state = self.state.lock().await;
        state.slots.values().map(|e| e.slot.clone()).collect()
    }

    pub async fn retired(&self) -> Vec<WorkerSlot> {
        let state = self.state.lock().await;
        state.retired.clone()
    }

    pub async fn occupancy(&self) -> PoolOccupancy {
        let state = self.state.lock().await;
        let mut occ = PoolOccupancy {
            retired: state.retired.len(),
            max_slots: self.max_slots,
            ..PoolOccupancy::default()
        };
        for entry in state.slots.values() {
            match entry.slot.state {
                SlotState::Idle => occ.idle += 1,
                SlotState::Busy => occ.busy += 1,
                SlotState::Blocked => occ.blocked += 1,
                SlotState::Retired => occ.retired += 1,
            }
        }
        occ
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::ScriptedWorkerFactory;
    use crate::ports::SequentialIdGenerator;
    use crate::ports::event_sink::testing::RecordingSink;

    fn pool(max: usize) -> (WorkerPool, ScriptedWorkerFactory, Arc<RecordingSink>) {
        let factory = ScriptedWorkerFactory::default();
        let mut reg = FactoryRegistry::new();
        reg.register(Role::Backend, Arc::new(factory.clone())).unwrap();
        reg.register(Role::Frontend, Arc::new(factory.clone())).unwrap();
        let sink = Arc::new(RecordingSink::default());
        let pool = WorkerPool::new(
            Arc::new(reg),
            max,
            Arc::new(SequentialIdGenerator::new()),
            sink.clone(),
        );
        (pool, factory, sink)
    }

    fn task(n: u128) -> TaskId {
        TaskId::from_raw(n)
    }

    #[tokio::test]
    async fn reuses_idle_slot_before_creating() {
        let (pool, factory, sink) = pool(10);

        let first = pool.acquire(Role::Backend, task(1)).await.unwrap();
        assert!(!first.reused);
        pool.complete(first.worker_id).await.unwrap();

        let second = pool.acquire(Role::Backend, task(2)).await.unwrap();
        assert!(second.reused);
        assert_eq!(second.worker_id, first.worker_id);
        assert_eq!(factory.spawned(), 1);
        assert_eq!(sink.kinds(), vec!["agent_created"]);

        let slot = pool.slot(second.worker_id).await.unwrap();
        assert_eq!(slot.state, SlotState::Busy);
        assert_eq!(slot.current_task, Some(task(2)));
        assert_eq!(slot.tasks_completed, 1);
    }

    #[tokio::test]
    async fn idle_slot_of_other_role_is_not_reused() {
        let (pool, factory, _) = pool(10);
        let backend = pool.acquire(Role::Backend, task(1)).await.unwrap();
        pool.release(backend.worker_id).await.unwrap();

        let frontend = pool.acquire(Role::Frontend, task(2)).await.unwrap();
        assert!(!frontend.reused);
        assert_ne!(frontend.worker_id, backend.worker_id);
        assert_eq!(factory.spawned(), 2);
    }

    #[tokio::test]
    async fn exhausted_at_max_slots() {
        let (pool, _, _) = pool(1);
        let held = pool.acquire(Role::Backend, task(1)).await.unwrap();

        let err = pool.acquire(Role::Backend, task(2)).await.unwrap_err();
        assert_eq!(err, PoolError::PoolExhausted { max: 1 });

        pool.release(held.worker_id).await.unwrap();
        assert!(pool.acquire(Role::Backend, task(2)).await.unwrap().reused);
    }

    #[tokio::test]
    async fn missing_factory_is_reported() {
        let (pool, _, _) = pool(2);
        let err = pool.acquire(Role::Test, task(1)).await.unwrap_err();
        assert_eq!(err, PoolError::NoFactory(Role::Test));
        assert!(pool.status().await.is_empty());
    }

    #[tokio::test]
    async fn blocked_slot_is_held_until_resumed() {
        let (pool, _, _) = pool(1);
        let slot = pool.acquire(Role::Backend, task(1)).await.unwrap();
        let blocker = BlockerId::from_raw(77);
        pool.mark_blocked(slot.worker_id, blocker).await.unwrap();

        assert!(matches!(
            pool.acquire(Role::Backend, task(2)).await,
            Err(PoolError::PoolExhausted { .. })
        ));
        assert_eq!(pool.occupancy().await.blocked, 1);

        pool.resume(slot.worker_id, task(1)).await.unwrap();
        let resumed = pool.slot(slot.worker_id).await.unwrap();
        assert_eq!(resumed.state, SlotState::Busy);
        assert!(resumed.blocked_by.is_none());

        let err = pool.resume(slot.worker_id, task(1)).await.err().expect("expected resume to fail");
        assert!(matches!(err, PoolError::InvalidSlotState { .. }));
    }

    #[tokio::test]
    async fn retire_frees_capacity_for_good() {
        let (pool, factory, sink) = pool(1);
        let slot = pool.acquire(Role::Backend, task(1)).await.unwrap();
        pool.retire(slot.worker_id).await.unwrap();

        let next = pool.acquire(Role::Backend, task(2)).await.unwrap();
        assert!(!next.reused);
        assert_ne!(next.worker_id, slot.worker_id);
        assert_eq!(factory.spawned(), 2);
        assert_eq!(pool.retired().await.len(), 1);
        assert_eq!(pool.occupancy().await.retired, 1);
        assert_eq!(sink.kinds(), vec!["agent_created", "agent_retired", "agent_created"]);

        assert_eq!(
            pool.release(slot.worker_id).await.unwrap_err(),
            PoolError::UnknownSlot(slot.worker_id)
        );
    }

    #[tokio::test]
    async fn release_all_idles_everything() {
        let (pool, _, _) = pool(3);
        let a = pool.acquire(Role::Backend, task(1)).await.unwrap();
        pool.acquire(Role::Frontend, task(2)).await.unwrap();
        pool.mark_blocked(a.worker_id, BlockerId::from_raw(1)).await.unwrap();

        assert_eq!(pool.release_all().await, 2);
        let occ = pool.occupancy().await;
        assert_eq!(occ.idle, 2);
        assert_eq!(occ.busy + occ.blocked, 0);
    }
}
