//! Task graph store: task records + dependency edges.
//!
//! Design:
//! - Single writer of Task records. Every status change goes through
//!   `set_status` so the transition rules and the `blocker_id` invariant are
//!   checked in one place.
//! - Graph mutations validate on a trial copy and commit by swap, so a
//!   rejected call leaves the graph observably unchanged.
//! - Status changes are appended to a change log that the coordinator drains
//!   and turns into push events.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::dependency::DependencyGraph;
use crate::domain::{BlockerId, FailureReason, GraphError, Task, TaskId, TaskStatus, WorkerId};

/// One applied status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub task_id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub blocker_id: Option<BlockerId>,
    pub failure: Option<FailureReason>,
}

/// Task counts by status.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub ready: usize,
    pub in_progress: usize,
    pub paused: usize,
    pub blocked: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskCounts {
    pub fn total(&self) -> usize {
        self.pending
            + self.ready
            + self.in_progress
            + self.paused
            + self.blocked
            + self.completed
            + self.failed
    }

    /// Nothing left that can make progress without a human.
    pub fn is_settled(&self) -> bool {
        self.pending + self.ready + self.in_progress + self.paused == 0
    }
}

#[derive(Debug, Default)]
pub struct TaskGraph {
    tasks: BTreeMap<TaskId, Task>,
    deps: DependencyGraph,
    changes: Vec<StatusChange>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// All tasks, ordered by id.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    fn task(&self, id: TaskId) -> Result<&Task, GraphError> {
        self.tasks.get(&id).ok_or(GraphError::UnknownTask(id))
    }

    fn task_mut(&mut self, id: TaskId) -> Result<&mut Task, GraphError> {
        self.tasks.get_mut(&id).ok_or(GraphError::UnknownTask(id))
    }

    /// Drain the status changes applied since the last call.
    pub fn take_changes(&mut self) -> Vec<StatusChange> {
        std::mem::take(&mut self.changes)
    }

    // ========================================
    // Graph construction
    // ========================================

    /// Add one task whose predecessors already exist.
    pub fn add_task(&mut self, task: Task) -> Result<(), GraphError> {
        self.add_tasks(vec![task])
    }

    /// Add a batch of tasks atomically. Predecessors may be existing tasks or
    /// other tasks of the same batch.
    ///
    /// Fails with `CycleDetected` (detected by DFS on a trial copy before
    /// commit) or any validation error; on failure nothing is applied.
    pub fn add_tasks(&mut self, batch: Vec<Task>) -> Result<(), GraphError> {
        let mut incoming: HashSet<TaskId> = HashSet::with_capacity(batch.len());
        for task in &batch {
            if self.tasks.contains_key(&task.id) || !incoming.insert(task.id) {
                return Err(GraphError::DuplicateTask(task.id));
            }
        }
        for task in &batch {
            for &pred in &task.depends_on {
                if pred == task.id {
                    return Err(GraphError::SelfDependency(task.id));
                }
                if !self.tasks.contains_key(&pred) && !incoming.contains(&pred) {
                    return Err(GraphError::UnknownPredecessor {
                        task: task.id,
                        predecessor: pred,
                    });
                }
            }
        }

        let mut trial = self.deps.clone();
        for task in &batch {
            for &pred in &task.depends_on {
                trial.add_dependency(task.id, pred);
            }
        }
        if let Some(cycle) = trial.detect_cycle() {
            return Err(GraphError::CycleDetected { cycle });
        }

        self.deps = trial;
        for mut task in batch {
            task.status = TaskStatus::Pending;
            task.blocker_id = None;
            self.tasks.insert(task.id, task);
        }
        Ok(())
    }

    /// Add an edge between two existing tasks: `task` now waits for `depends_on`.
    ///
    /// Only tasks that have not started may gain predecessors. A ready task
    /// whose new predecessor is not completed goes back to pending.
    pub fn add_dependency(
        &mut self,
        task: TaskId,
        depends_on: TaskId,
        now: DateTime<Utc>,
    ) -> Result<(), GraphError> {
        if task == depends_on {
            return Err(GraphError::SelfDependency(task));
        }
        let status = self.task(task)?.status;
        let pred_status = self
            .tasks
            .get(&depends_on)
            .map(|t| t.status)
            .ok_or(GraphError::UnknownPredecessor {
                task,
                predecessor: depends_on,
            })?;
        if !matches!(status, TaskStatus::Pending | TaskStatus::Ready | TaskStatus::Blocked) {
            return Err(GraphError::InvalidTransition {
                task,
                from: status,
                to: TaskStatus::Pending,
            });
        }

        let mut trial = self.deps.clone();
        trial.add_dependency(task, depends_on);
        if let Some(cycle) = trial.detect_cycle() {
            return Err(GraphError::CycleDetected { cycle });
        }
        self.deps = trial;

        let record = self.task_mut(task)?;
        if !record.depends_on.contains(&depends_on) {
            record.depends_on.push(depends_on);
        }
        if status == TaskStatus::Ready && pred_status != TaskStatus::Completed {
            self.set_status(task, TaskStatus::Pending, now)?;
        }
        Ok(())
    }

    // ========================================
    // Status transitions
    // ========================================

    /// Apply one transition. Leaving `Paused` always clears `blocker_id`.
    pub fn set_status(
        &mut self,
        id: TaskId,
        to: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<TaskStatus, GraphError> {
        self.transition(id, to, None, None, now)
    }

    fn transition(
        &mut self,
        id: TaskId,
        to: TaskStatus,
        blocker_id: Option<BlockerId>,
        failure: Option<FailureReason>,
        now: DateTime<Utc>,
    ) -> Result<TaskStatus, GraphError> {
        let task = self.tasks.get_mut(&id).ok_or(GraphError::UnknownTask(id))?;
        let from = task.status;
        if !from.can_transition_to(to) {
            return Err(GraphError::InvalidTransition { task: id, from, to });
        }
        task.status = to;
        task.blocker_id = if to == TaskStatus::Paused { blocker_id } else { None };
        if failure.is_some() {
            task.failure = failure.clone();
        }
        if !matches!(to, TaskStatus::InProgress | TaskStatus::Paused) {
            task.assigned_worker = None;
        }
        task.updated_at = now;
        self.changes.push(StatusChange {
            task_id: id,
            from,
            to,
            blocker_id: task.blocker_id,
            failure,
        });
        Ok(from)
    }

    /// Re-evaluate every pending task in dependency order:
    /// all predecessors completed -> ready; any predecessor failed or blocked -> blocked.
    pub fn refresh_readiness(&mut self, now: DateTime<Utc>) {
        let order = self
            .deps
            .topological_order(self.tasks.keys().copied())
            .unwrap_or_else(|| self.tasks.keys().copied().collect());

        for id in order {
            let Some(task) = self.tasks.get(&id) else {
                continue;
            };
            if task.status != TaskStatus::Pending {
                continue;
            }
            let pred_states: Vec<TaskStatus> = task
                .depends_on
                .iter()
                .filter_map(|p| self.tasks.get(p).map(|t| t.status))
                .collect();

            let next = if pred_states.iter().all(|s| *s == TaskStatus::Completed) {
                Some(TaskStatus::Ready)
            } else if pred_states
                .iter()
                .any(|s| matches!(s, TaskStatus::Failed | TaskStatus::Blocked))
            {
                Some(TaskStatus::Blocked)
            } else {
                None
            };
            if let Some(next) = next {
                // pending -> ready / blocked are always legal
                let _ = self.set_status(id, next, now);
            }
        }
    }

    /// Every task whose predecessors are all completed and which is waiting
    /// to run, sorted by id.
    ///
    /// Pending tasks that qualify are promoted to `ready` first.
    pub fn ready_tasks(&mut self, now: DateTime<Utc>) -> Vec<TaskId> {
        self.refresh_readiness(now);
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Ready)
            .map(|t| t.id)
            .collect()
    }

    /// Transitive successors of `id`, sorted.
    pub fn all_dependents(&self, id: TaskId) -> Result<Vec<TaskId>, GraphError> {
        self.task(id)?;
        Ok(self.deps.all_dependents(id))
    }

    /// in_progress -> completed; returns the direct dependents that became ready.
    pub fn mark_completed(&mut self, id: TaskId, now: DateTime<Utc>) -> Result<Vec<TaskId>, GraphError> {
        self.transition(id, TaskStatus::Completed, None, None, now)?;
        if let Some(task) = self.tasks.get_mut(&id) {
            task.progress = 100;
        }

        let mut promoted = Vec::new();
        for succ in self.deps.dependents(id) {
            let Some(task) = self.tasks.get(&succ) else {
                continue;
            };
            if !matches!(task.status, TaskStatus::Pending | TaskStatus::Blocked) {
                continue;
            }
            let satisfied = task
                .depends_on
                .iter()
                .all(|p| self.tasks.get(p).is_some_and(|t| t.status == TaskStatus::Completed));
            if satisfied {
                self.set_status(succ, TaskStatus::Ready, now)?;
                promoted.push(succ);
            }
        }
        Ok(promoted)
    }

    /// ready|paused -> in_progress on `worker`.
    pub fn start(&mut self, id: TaskId, worker: WorkerId, now: DateTime<Utc>) -> Result<(), GraphError> {
        self.transition(id, TaskStatus::InProgress, None, None, now)?;
        let task = self.task_mut(id)?;
        task.assigned_worker = Some(worker);
        Ok(())
    }

    /// Bump the retry counter after a failed execution; returns the updated task.
    pub fn record_failure(&mut self, id: TaskId, error: Option<String>) -> Result<Task, GraphError> {
        let task = self.task_mut(id)?;
        task.retry_count += 1;
        task.last_error = error;
        Ok(task.clone())
    }

    pub fn set_progress(&mut self, id: TaskId, progress: u8) -> Result<(), GraphError> {
        self.task_mut(id)?.set_progress(progress);
        Ok(())
    }

    /// Permanently fail `id` and block its waiting dependents.
    ///
    /// Dependents paused by `paused_by` are blocked too (their blocker is
    /// gone); dependents paused by another blocker keep waiting for it.
    pub fn fail(
        &mut self,
        id: TaskId,
        reason: FailureReason,
        paused_by: Option<BlockerId>,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, GraphError> {
        self.transition(id, TaskStatus::Failed, None, Some(reason), now)?;

        let mut blocked = Vec::new();
        for dep in self.deps.all_dependents(id) {
            let Some(task) = self.tasks.get(&dep) else {
                continue;
            };
            let block = match task.status {
                TaskStatus::Pending | TaskStatus::Ready => true,
                TaskStatus::Paused => paused_by.is_some() && task.blocker_id == paused_by,
                _ => false,
            };
            if block {
                self.set_status(dep, TaskStatus::Blocked, now)?;
                blocked.push(dep);
            }
        }
        Ok(blocked)
    }

    /// Pause `origin` and every non-terminal task downstream of it.
    ///
    /// Tasks already paused by another blocker keep their blocker. Returns the
    /// tasks paused by this call, sorted.
    pub fn pause_closure(
        &mut self,
        origin: TaskId,
        blocker_id: BlockerId,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, GraphError> {
        let mut targets = self.all_dependents(origin)?;
        targets.push(origin);
        targets.sort();

        let mut paused = Vec::new();
        for id in targets {
            let Some(task) = self.tasks.get(&id) else {
                continue;
            };
            if task.status.is_terminal() || task.status == TaskStatus::Paused {
                continue;
            }
            self.transition(id, TaskStatus::Paused, Some(blocker_id), None, now)?;
            paused.push(id);
        }
        Ok(paused)
    }

    /// Tasks currently paused by `blocker_id`, sorted.
    pub fn paused_by(&self, blocker_id: BlockerId) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Paused && t.blocker_id == Some(blocker_id))
            .map(|t| t.id)
            .collect()
    }

    /// Manual restart: failed -> pending with a fresh retry budget. Dependents
    /// that were blocked go back to pending too. Returns every task touched.
    pub fn restart(&mut self, id: TaskId, now: DateTime<Utc>) -> Result<Vec<TaskId>, GraphError> {
        self.transition(id, TaskStatus::Pending, None, None, now)?;
        let task = self.task_mut(id)?;
        task.retry_count = 0;
        task.failure = None;
        task.last_error = None;
        task.progress = 0;

        let mut touched = vec![id];
        for dep in self.deps.all_dependents(id) {
            if self.tasks.get(&dep).is_some_and(|t| t.status == TaskStatus::Blocked) {
                self.set_status(dep, TaskStatus::Pending, now)?;
                touched.push(dep);
            }
        }
        Ok(touched)
    }

    // ========================================
    // Queries
    // ========================================

    /// Predecessors first, ties broken by id.
    pub fn topological_order(&self) -> Vec<TaskId> {
        self.deps
            .topological_order(self.tasks.keys().copied())
            .unwrap_or_default()
    }

    /// Length of the longest predecessor chain above `id` (roots are 0).
    pub fn dependency_depth(&self, id: TaskId) -> Result<usize, GraphError> {
        self.task(id)?;
        let mut depth: HashMap<TaskId, usize> = HashMap::new();
        for node in self.topological_order() {
            let d = self
                .deps
                .dependencies(node)
                .iter()
                .filter_map(|p| depth.get(p))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(node, d);
        }
        Ok(depth.get(&id).copied().unwrap_or(0))
    }

    /// Unfinished tasks with at least one incomplete predecessor, mapped to
    /// those predecessors.
    pub fn blocked_tasks(&self) -> BTreeMap<TaskId, Vec<TaskId>> {
        self.tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .filter_map(|t| {
                let waiting: Vec<TaskId> = t
                    .depends_on
                    .iter()
                    .copied()
                    .filter(|p| self.tasks.get(p).is_none_or(|pt| pt.status != TaskStatus::Completed))
                    .collect();
                (!waiting.is_empty()).then_some((t.id, waiting))
            })
            .collect()
    }

    pub fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts::default();
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Ready => counts.ready += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Paused => counts.paused += 1,
                TaskStatus::Blocked => counts.blocked += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Role;

    fn id(n: u128) -> TaskId {
        TaskId::from_raw(n)
    }

    fn task(n: u128, deps: &[u128]) -> Task {
        Task::new(id(n), format!("t{n}"), Role::Backend, deps.iter().map(|d| id(*d)), Utc::now())
    }

    fn status(graph: &TaskGraph, n: u128) -> TaskStatus {
        graph.get(id(n)).unwrap().status
    }

    /// A <- B <- C
    fn chain() -> TaskGraph {
        let mut graph = TaskGraph::new();
        graph
            .add_tasks(vec![task(1, &[]), task(2, &[1]), task(3, &[2])])
            .unwrap();
        graph
    }

    fn run(graph: &mut TaskGraph, n: u128) {
        graph.start(id(n), WorkerId::from_raw(100), Utc::now()).unwrap();
    }

    #[test]
    fn rejects_duplicates_self_and_unknown() {
        let mut graph = chain();
        assert_eq!(graph.add_task(task(1, &[])), Err(GraphError::DuplicateTask(id(1))));
        assert_eq!(graph.add_task(task(4, &[4])), Err(GraphError::SelfDependency(id(4))));
        assert_eq!(
            graph.add_task(task(4, &[9])),
            Err(GraphError::UnknownPredecessor {
                task: id(4),
                predecessor: id(9)
            })
        );
        assert_eq!(graph.len(), 3);
    }

    #[test]
    fn batch_with_cycle_is_rejected_atomically() {
        let mut graph = chain();
        let before: Vec<Task> = graph.tasks().cloned().collect();

        let err = graph
            .add_tasks(vec![task(4, &[5]), task(5, &[4])])
            .unwrap_err();
        assert!(matches!(err, GraphError::CycleDetected { .. }));

        let after: Vec<Task> = graph.tasks().cloned().collect();
        assert_eq!(before, after);
        assert!(graph.take_changes().is_empty());
    }

    #[test]
    fn edge_closing_a_cycle_is_rejected() {
        let mut graph = chain();
        let err = graph.add_dependency(id(1), id(3), Utc::now()).unwrap_err();
        assert!(matches!(err, GraphError::CycleDetected { .. }));
        assert!(graph.get(id(1)).unwrap().depends_on.is_empty());
        assert!(graph.all_dependents(id(3)).unwrap().is_empty());
    }

    #[test]
    fn ready_tasks_promotes_roots_only() {
        let mut graph = chain();
        assert_eq!(graph.ready_tasks(Utc::now()), vec![id(1)]);
        assert_eq!(status(&graph, 1), TaskStatus::Ready);
        assert_eq!(status(&graph, 2), TaskStatus::Pending);

        let changes = graph.take_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].to, TaskStatus::Ready);
    }

    #[test]
    fn completing_a_unblocks_b_but_not_c() {
        let mut graph = chain();
        graph.ready_tasks(Utc::now());
        run(&mut graph, 1);

        let promoted = graph.mark_completed(id(1), Utc::now()).unwrap();
        assert_eq!(promoted, vec![id(2)]);
        assert_eq!(status(&graph, 2), TaskStatus::Ready);
        assert_eq!(status(&graph, 3), TaskStatus::Pending);
        assert_eq!(graph.get(id(1)).unwrap().progress, 100);
    }

    #[test]
    fn completing_requires_in_progress() {
        let mut graph = chain();
        let err = graph.mark_completed(id(1), Utc::now()).unwrap_err();
        assert!(matches!(err, GraphError::InvalidTransition { .. }));
    }

    #[test]
    fn new_edge_demotes_ready_task() {
        let mut graph = chain();
        graph.add_task(task(4, &[])).unwrap();
        graph.ready_tasks(Utc::now());
        assert_eq!(status(&graph, 4), TaskStatus::Ready);

        graph.add_dependency(id(4), id(3), Utc::now()).unwrap();
        assert_eq!(status(&graph, 4), TaskStatus::Pending);
        assert_eq!(graph.ready_tasks(Utc::now()), vec![id(1)]);
    }

    #[test]
    fn pause_closure_covers_origin_and_downstream() {
        let mut graph = chain();
        graph.add_task(task(4, &[])).unwrap();
        let blocker = BlockerId::from_raw(50);

        let paused = graph.pause_closure(id(2), blocker, Utc::now()).unwrap();
        assert_eq!(paused, vec![id(2), id(3)]);
        assert_eq!(graph.paused_by(blocker), vec![id(2), id(3)]);
        assert_eq!(status(&graph, 1), TaskStatus::Pending);
        assert_eq!(status(&graph, 4), TaskStatus::Pending);
        assert!(graph.get(id(1)).unwrap().blocker_id.is_none());
    }

    #[test]
    fn leaving_paused_clears_blocker_id() {
        let mut graph = chain();
        graph.pause_closure(id(3), BlockerId::from_raw(50), Utc::now()).unwrap();
        assert_eq!(graph.get(id(3)).unwrap().blocker_id, Some(BlockerId::from_raw(50)));

        graph.set_status(id(3), TaskStatus::Pending, Utc::now()).unwrap();
        assert!(graph.get(id(3)).unwrap().blocker_id.is_none());
    }

    #[test]
    fn failure_blocks_downstream_and_restart_unblocks() {
        let mut graph = chain();
        graph.ready_tasks(Utc::now());
        run(&mut graph, 1);

        let reason = FailureReason::RetryExceeded {
            attempts: 3,
            last_error: None,
        };
        let blocked = graph.fail(id(1), reason.clone(), None, Utc::now()).unwrap();
        assert_eq!(blocked, vec![id(2), id(3)]);
        assert_eq!(graph.get(id(1)).unwrap().failure, Some(reason));
        assert!(graph.ready_tasks(Utc::now()).is_empty());

        let touched = graph.restart(id(1), Utc::now()).unwrap();
        assert_eq!(touched, vec![id(1), id(2), id(3)]);
        assert_eq!(graph.get(id(1)).unwrap().retry_count, 0);
        assert!(graph.get(id(1)).unwrap().failure.is_none());
        assert_eq!(graph.ready_tasks(Utc::now()), vec![id(1)]);
        assert_eq!(status(&graph, 2), TaskStatus::Pending);
    }

    #[test]
    fn failure_keeps_tasks_paused_by_other_blockers() {
        let mut graph = chain();
        graph.ready_tasks(Utc::now());
        run(&mut graph, 1);
        let other = BlockerId::from_raw(60);
        graph.pause_closure(id(3), other, Utc::now()).unwrap();

        graph
            .fail(
                id(1),
                FailureReason::RetryExceeded {
                    attempts: 3,
                    last_error: None,
                },
                None,
                Utc::now(),
            )
            .unwrap();
        assert_eq!(status(&graph, 2), TaskStatus::Blocked);
        assert_eq!(status(&graph, 3), TaskStatus::Paused);

        // once its own blocker is gone it falls in line behind the failure
        graph.set_status(id(3), TaskStatus::Pending, Utc::now()).unwrap();
        graph.refresh_readiness(Utc::now());
        assert_eq!(status(&graph, 3), TaskStatus::Blocked);
    }

    #[test]
    fn queries_depth_order_and_blocked_map() {
        let mut graph = TaskGraph::new();
        // 1 <- 2 <- 4, 1 <- 3 <- 4
        graph
            .add_tasks(vec![task(4, &[2, 3]), task(3, &[1]), task(2, &[1]), task(1, &[])])
            .unwrap();

        assert_eq!(graph.topological_order(), vec![id(1), id(2), id(3), id(4)]);
        assert_eq!(graph.dependency_depth(id(1)).unwrap(), 0);
        assert_eq!(graph.dependency_depth(id(4)).unwrap(), 2);

        let blocked = graph.blocked_tasks();
        assert_eq!(blocked.get(&id(4)), Some(&vec![id(2), id(3)]));
        assert!(!blocked.contains_key(&id(1)));

        let counts = graph.counts();
        assert_eq!(counts.pending, 4);
        assert_eq!(counts.total(), 4);
        assert!(!counts.is_settled());
    }
}
