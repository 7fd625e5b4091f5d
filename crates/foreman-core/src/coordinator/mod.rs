//! Coordinator - スケジューリングと blocker 解決の中心
//!
//! Design:
//! - 1 プロジェクトにつき 1 つ。グローバル状態は持たず、依存はすべて `CoordinatorParts` で渡す。
//! - ロックは 3 つ（task graph / pool / blocker store）で、取得順は常に graph -> pool -> blockers。
//!   ワーカーの実行中はどのロックも保持しない。
//! - ワーカーは tokio タスクとして実行し、結果は `apply_outcome` で反映する。
//! - SYNC blocker で止まったワーカーは `SuspendedTask` として明示的に記録し、
//!   解決時に同じスロットで回答付きコンテキストを渡して再実行する。
//!
//! サブモジュール:
//! - `scheduling`: run_cycle / apply_outcome / 失敗時の判断
//! - `resolution`: blocker の作成・解決・期限切れ・poll fallback

mod resolution;
mod scheduling;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, watch};
use tracing::{debug, info};

use crate::blocker::{BlockerService, BlockerView};
use crate::config::ForemanConfig;
use crate::domain::{
    Blocker, BlockerId, Decider, DecisionRecord, DefaultDecider, DomainEvent, ForemanError, ProjectId, Role,
    Task, TaskId, WorkerId, WorkerSlot,
};
use crate::graph::{Plan, TaskCounts, TaskGraph};
use crate::pool::{FactoryRegistry, PoolOccupancy, WorkerPool};
use crate::ports::{BlockerStore, Clock, EventSink, IdGenerator, Snapshot, SnapshotSource, WorkContext};

pub use scheduling::CycleReport;

/// A worker parked on a SYNC blocker, keeping its slot until the answer arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspendedTask {
    pub task_id: TaskId,
    pub blocker_id: BlockerId,
    pub worker_id: WorkerId,
    pub context: WorkContext,
    pub suspended_at: DateTime<Utc>,
}

/// A worker suspended on a SYNC blocker while its execution was still
/// running. Its eventual return is the checkpoint; this says what happens then.
#[derive(Debug, Clone)]
enum AfterCheckpoint {
    /// Still unanswered: keep the slot blocked.
    Hold,
    /// Answered before the worker returned: re-enter with the answer.
    Resume(SuspendedTask),
    /// Expired or abandoned: free the slot.
    Release,
}

/// Everything a coordinator is built from.
pub struct CoordinatorParts {
    pub config: ForemanConfig,
    pub registry: FactoryRegistry,
    pub store: Arc<dyn BlockerStore>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
    pub events: Arc<dyn EventSink>,
    /// Defaults to `DefaultDecider` configured from `config`.
    pub decider: Option<Arc<dyn Decider>>,
}

#[derive(Default)]
struct State {
    graph: TaskGraph,
    suspended: HashMap<BlockerId, SuspendedTask>,
    checkpoints: HashMap<WorkerId, AfterCheckpoint>,
    /// Answers collected per task, handed to every later execution.
    contexts: HashMap<TaskId, WorkContext>,
    /// Tasks deprioritized by a PENDING ASYNC blocker.
    async_waits: HashMap<TaskId, BlockerId>,
    decisions: Vec<DecisionRecord>,
    stopped: bool,
}

struct Inner {
    project_id: ProjectId,
    config: ForemanConfig,
    state: Mutex<State>,
    pool: WorkerPool,
    blockers: BlockerService,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    events: Arc<dyn EventSink>,
    decider: Arc<dyn Decider>,
    /// Wakes the run loop early (completion, resolution, new tasks).
    trigger: Notify,
    stop_tx: watch::Sender<bool>,
    running: AtomicUsize,
    idle: Notify,
}

/// Cheap to clone; every clone drives the same project.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

/// Decrements the in-flight counter when an execution ends (even by panic).
struct InFlight(Arc<Inner>);

impl InFlight {
    fn enter(inner: &Arc<Inner>) -> Self {
        inner.running.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(inner))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.running.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl Coordinator {
    pub fn new(parts: CoordinatorParts) -> Self {
        let CoordinatorParts {
            config,
            registry,
            store,
            clock,
            ids,
            events,
            decider,
        } = parts;

        let decider = decider.unwrap_or_else(|| {
            Arc::new(
                DefaultDecider::new(config.retry_policy()).with_escalation(config.escalate_human_failures),
            )
        });
        let pool = WorkerPool::new(
            Arc::new(registry),
            config.max_slots,
            Arc::clone(&ids),
            Arc::clone(&events),
        );
        let blockers = BlockerService::new(
            store,
            Arc::clone(&clock),
            Arc::clone(&ids),
            Arc::clone(&events),
            config.blocker_limits(),
        );
        let (stop_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                project_id: ids.generate_project_id(),
                config,
                state: Mutex::new(State::default()),
                pool,
                blockers,
                clock,
                ids,
                events,
                decider,
                trigger: Notify::new(),
                stop_tx,
                running: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    pub fn project_id(&self) -> ProjectId {
        self.inner.project_id
    }

    pub fn config(&self) -> &ForemanConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    pub fn blockers(&self) -> &BlockerService {
        &self.inner.blockers
    }

    /// Wake the run loop without waiting for the next tick.
    pub fn trigger(&self) {
        self.inner.trigger.notify_one();
    }

    fn flush_changes(&self, state: &mut State) {
        for change in state.graph.take_changes() {
            self.inner.events.emit(DomainEvent::TaskStatusChanged {
                task_id: change.task_id,
                from: change.from,
                to: change.to,
                blocker_id: change.blocker_id,
                failure: change.failure,
            });
        }
    }

    fn record_decision(
        &self,
        state: &mut State,
        task_id: TaskId,
        trigger: serde_json::Value,
        policy: &str,
        decision: &str,
        now: DateTime<Utc>,
    ) {
        debug!(%task_id, policy, decision, "decision recorded");
        state
            .decisions
            .push(DecisionRecord::new(task_id, trigger, policy, decision, None, now));
    }

    // ========================================
    // Graph commands
    // ========================================

    /// Add one task. Predecessors must already exist.
    pub async fn add_task(
        &self,
        title: impl Into<String>,
        role: Role,
        depends_on: Vec<TaskId>,
    ) -> Result<TaskId, ForemanError> {
        let now = self.inner.clock.now();
        let task = Task::new(self.inner.ids.generate_task_id(), title, role, depends_on, now);
        let id = task.id;
        let mut state = self.inner.state.lock().await;
        state.graph.add_task(task)?;
        info!(task_id = %id, %role, "task added");
        drop(state);
        self.trigger();
        Ok(id)
    }

    /// Load a whole plan atomically; returns the ids allocated per plan key.
    pub async fn load_plan(&self, plan: &Plan) -> Result<BTreeMap<String, TaskId>, ForemanError> {
        let now = self.inner.clock.now();
        let (tasks, keys) = plan.build(self.inner.ids.as_ref(), now)?;
        let count = tasks.len();
        let mut state = self.inner.state.lock().await;
        state.graph.add_tasks(tasks)?;
        info!(tasks = count, "plan loaded");
        drop(state);
        self.trigger();
        Ok(keys)
    }

    pub async fn add_dependency(&self, task_id: TaskId, depends_on: TaskId) -> Result<(), ForemanError> {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock().await;
        state.graph.add_dependency(task_id, depends_on, now)?;
        self.flush_changes(&mut state);
        Ok(())
    }

    /// Manual intervention: failed -> pending with a fresh retry budget; its
    /// blocked dependents go back to pending too.
    pub async fn restart_task(&self, task_id: TaskId) -> Result<Vec<TaskId>, ForemanError> {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock().await;
        let touched = state.graph.restart(task_id, now)?;
        self.record_decision(
            &mut state,
            task_id,
            serde_json::json!({ "trigger": "manual_restart" }),
            "manual",
            "restart",
            now,
        );
        self.flush_changes(&mut state);
        drop(state);
        info!(%task_id, touched = touched.len(), "task restarted");
        self.trigger();
        Ok(touched)
    }

    // ========================================
    // Queries
    // ========================================

    pub async fn task(&self, task_id: TaskId) -> Option<Task> {
        let state = self.inner.state.lock().await;
        state.graph.get(task_id).cloned()
    }

    /// Every task, ordered by id.
    pub async fn tasks(&self) -> Vec<Task> {
        let state = self.inner.state.lock().await;
        state.graph.tasks().cloned().collect()
    }

    pub async fn topological_order(&self) -> Vec<TaskId> {
        let state = self.inner.state.lock().await;
        state.graph.topological_order()
    }

    /// Unfinished tasks mapped to the predecessors they are still waiting on.
    pub async fn waiting_on(&self) -> BTreeMap<TaskId, Vec<TaskId>> {
        let state = self.inner.state.lock().await;
        state.graph.blocked_tasks()
    }

    pub async fn counts(&self) -> TaskCounts {
        let state = self.inner.state.lock().await;
        state.graph.counts()
    }

    pub async fn suspended(&self) -> Vec<SuspendedTask> {
        let state = self.inner.state.lock().await;
        let mut rows: Vec<SuspendedTask> = state.suspended.values().cloned().collect();
        rows.sort_by_key(|s| s.task_id);
        rows
    }

    pub async fn context(&self, task_id: TaskId) -> WorkContext {
        let state = self.inner.state.lock().await;
        state.contexts.get(&task_id).cloned().unwrap_or_default()
    }

    pub async fn decisions(&self) -> Vec<DecisionRecord> {
        let state = self.inner.state.lock().await;
        state.decisions.clone()
    }

    pub async fn workers(&self) -> Vec<WorkerSlot> {
        self.inner.pool.status().await
    }

    pub async fn occupancy(&self) -> PoolOccupancy {
        self.inner.pool.occupancy().await
    }

    /// Blockers newest first, with the asking worker's role and the task title.
    pub async fn list_blockers(&self, status: Option<crate::domain::BlockerStatus>) -> Vec<BlockerView> {
        let rows = self.inner.blockers.list(status).await;
        let mut roles: HashMap<WorkerId, Role> = self
            .inner
            .pool
            .status()
            .await
            .into_iter()
            .map(|s| (s.id, s.role))
            .collect();
        for slot in self.inner.pool.retired().await {
            roles.insert(slot.id, slot.role);
        }

        let now = self.inner.clock.now();
        let state = self.inner.state.lock().await;
        rows.into_iter()
            .map(|b| {
                let title = b
                    .task_id
                    .and_then(|id| state.graph.get(id))
                    .map(|t| t.title.clone());
                let role = roles.get(&b.worker_id).copied();
                BlockerView::new(b, role, title, now)
            })
            .collect()
    }

    pub async fn pending_blocker_for_worker(&self, worker_id: WorkerId) -> Option<Blocker> {
        self.inner.blockers.pending_for_worker(worker_id).await
    }

    /// Point-in-time copy of tasks, blockers and workers, read in parallel.
    pub async fn snapshot(&self) -> Snapshot {
        let (tasks, blockers, workers) = tokio::join!(
            self.tasks(),
            self.inner.blockers.list(None),
            self.inner.pool.status(),
        );
        Snapshot {
            project_id: self.inner.project_id,
            tasks,
            blockers,
            workers,
            taken_at: self.inner.clock.now(),
        }
    }

    // ========================================
    // Lifecycle
    // ========================================

    /// Scheduling loop: one cycle per tick or trigger, until `stop`.
    pub async fn run(&self) {
        let mut stop_rx = self.inner.stop_tx.subscribe();
        let mut ticker = tokio::time::interval(self.inner.config.schedule_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(project_id = %self.inner.project_id, "coordinator loop started");

        loop {
            if *stop_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = stop_rx.changed() => continue,
                _ = ticker.tick() => {}
                _ = self.inner.trigger.notified() => {}
            }
            let report = self.run_cycle().await;
            if !report.assigned.is_empty() || report.exhausted {
                debug!(
                    assigned = report.assigned.len(),
                    deferred_async = report.deferred_async,
                    exhausted = report.exhausted,
                    "cycle"
                );
            }
        }
        info!(project_id = %self.inner.project_id, "coordinator loop stopped");
    }

    /// Stop scheduling, signal running workers, return every slot to idle.
    ///
    /// Running executions are not aborted. A worker leaving at its stop
    /// checkpoint puts its task back to `pending` without spending a retry.
    pub async fn stop(&self) {
        let mut state = self.inner.state.lock().await;
        if state.stopped {
            return;
        }
        state.stopped = true;
        self.inner.stop_tx.send_replace(true);
        let released = self.inner.pool.release_all().await;
        drop(state);
        info!(released, "coordinator stopped");
    }

    pub async fn is_stopped(&self) -> bool {
        self.inner.state.lock().await.stopped
    }

    /// Number of worker executions currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Wait until no worker execution is running.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.inner.idle.notified();
            if self.inner.running.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }
}

#[async_trait]
impl SnapshotSource for Coordinator {
    async fn snapshot(&self) -> Snapshot {
        Coordinator::snapshot(self).await
    }

    async fn blockers(&self) -> (Vec<Blocker>, DateTime<Utc>) {
        let rows = self.inner.blockers.list(None).await;
        (rows, self.inner.clock.now())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use chrono::TimeZone;

    use super::*;
    use crate::impls::{InMemoryBlockerStore, Script, ScriptedWorkerFactory};
    use crate::ports::event_sink::testing::RecordingSink;
    use crate::ports::{FixedClock, SequentialIdGenerator};

    pub(crate) struct Harness {
        pub coordinator: Coordinator,
        pub factory: ScriptedWorkerFactory,
        pub clock: Arc<FixedClock>,
        pub sink: Arc<RecordingSink>,
    }

    pub(crate) fn harness(config: ForemanConfig, scripts: &[(&str, Script)]) -> Harness {
        let scripts: HashMap<String, Script> =
            scripts.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        let factory = ScriptedWorkerFactory::new(scripts);
        let mut registry = FactoryRegistry::new();
        for role in Role::ALL {
            registry.register(role, Arc::new(factory.clone())).unwrap();
        }
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let sink = Arc::new(RecordingSink::default());
        let coordinator = Coordinator::new(CoordinatorParts {
            config,
            registry,
            store: Arc::new(InMemoryBlockerStore::new()),
            clock: clock.clone(),
            ids: Arc::new(SequentialIdGenerator::new()),
            events: sink.clone(),
            decider: None,
        });
        Harness {
            coordinator,
            factory,
            clock,
            sink,
        }
    }

    /// Run cycles until nothing new gets assigned and no execution is running.
    pub(crate) async fn drive(coordinator: &Coordinator, max_cycles: usize) {
        for _ in 0..max_cycles {
            let report = coordinator.run_cycle().await;
            coordinator.wait_idle().await;
            if report.assigned.is_empty() && coordinator.in_flight() == 0 {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::harness;
    use super::*;
    use crate::domain::{GraphError, TaskStatus};
    use crate::graph::PlanEntry;

    #[tokio::test]
    async fn rejected_task_leaves_graph_unchanged() {
        let h = harness(ForemanConfig::default(), &[]);
        let a = h.coordinator.add_task("a", Role::Backend, vec![]).await.unwrap();

        let err = h
            .coordinator
            .add_task("b", Role::Backend, vec![a, TaskId::from_raw(999)])
            .await
            .unwrap_err();
        assert!(matches!(err, ForemanError::Graph(GraphError::UnknownPredecessor { .. })));
        assert_eq!(h.coordinator.tasks().await.len(), 1);
    }

    #[tokio::test]
    async fn load_plan_maps_keys_to_ids() {
        let h = harness(ForemanConfig::default(), &[]);
        let plan = Plan {
            tasks: vec![
                PlanEntry {
                    key: "ui".into(),
                    title: "UI".into(),
                    role: Role::Frontend,
                    depends_on: vec!["api".into()],
                },
                PlanEntry {
                    key: "api".into(),
                    title: "API".into(),
                    role: Role::Backend,
                    depends_on: vec![],
                },
            ],
        };
        let keys = h.coordinator.load_plan(&plan).await.unwrap();
        assert_eq!(h.coordinator.topological_order().await, vec![keys["api"], keys["ui"]]);
        let ui = h.coordinator.task(keys["ui"]).await.unwrap();
        assert_eq!(ui.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn snapshot_carries_every_entity() {
        let h = harness(ForemanConfig::default(), &[]);
        h.coordinator.add_task("a", Role::Backend, vec![]).await.unwrap();
        let snap = h.coordinator.snapshot().await;
        assert_eq!(snap.project_id, h.coordinator.project_id());
        assert_eq!(snap.tasks.len(), 1);
        assert!(snap.blockers.is_empty());
        assert_eq!(snap.taken_at, h.clock.now());
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_wakes_the_loop() {
        let h = harness(ForemanConfig::default(), &[]);
        let runner = {
            let c = h.coordinator.clone();
            tokio::spawn(async move { c.run().await })
        };
        h.coordinator.stop().await;
        h.coordinator.stop().await;
        runner.await.unwrap();
        assert!(h.coordinator.is_stopped().await);
    }
}
