//! Scheduling cycle and outcome handling.
//!
//! One cycle: promote ready tasks, hand them to pool slots (tasks waiting on a
//! PENDING ASYNC blocker go last), spawn each execution. Each outcome comes
//! back through `apply_outcome`, which is the only place a running task
//! leaves `in_progress` (apart from blocker expiry).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::{Coordinator, InFlight, State, SuspendedTask};
use crate::domain::{
    Blocker, BlockerId, BlockerType, Decision, FailureReason, ForemanError, GraphError, Outcome, OutcomeKind,
    PoolError, TaskId, TaskStatus, WorkerId,
};
use crate::ports::{Assignment, BlockerAnswer, Worker};

pub(super) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// What one scheduling cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Tasks handed to a worker, in dispatch order.
    pub assigned: Vec<(TaskId, WorkerId)>,
    /// Ready tasks pushed to the back because of a PENDING ASYNC blocker.
    pub deferred_async: usize,
    /// The pool ran out of slots; the remaining ready tasks wait for the next cycle.
    pub exhausted: bool,
}

impl Coordinator {
    /// Assign every ready task the pool can take right now.
    ///
    /// `PoolExhausted` ends the cycle and is reported, never returned.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        let mut state = self.inner.state.lock().await;
        if state.stopped {
            return report;
        }
        let now = self.inner.clock.now();
        let ready = state.graph.ready_tasks(now);
        self.flush_changes(&mut state);

        let mut first = Vec::with_capacity(ready.len());
        let mut deferred = Vec::new();
        for task_id in ready {
            let waiting_on = state.async_waits.get(&task_id).copied();
            let defer = match waiting_on {
                Some(blocker_id) => self.async_wait_pending(&mut state, task_id, blocker_id).await,
                None => false,
            };
            if defer {
                deferred.push(task_id);
            } else {
                first.push(task_id);
            }
        }
        report.deferred_async = deferred.len();

        for task_id in first.into_iter().chain(deferred) {
            let Some(role) = state.graph.get(task_id).map(|t| t.role) else {
                continue;
            };
            let slot = match self.inner.pool.acquire(role, task_id).await {
                Ok(slot) => slot,
                Err(PoolError::PoolExhausted { max }) => {
                    debug!(max, %task_id, "pool exhausted, ready tasks wait for a free slot");
                    report.exhausted = true;
                    break;
                }
                Err(err) => {
                    warn!(%task_id, %role, error = %err, "cannot acquire a worker");
                    continue;
                }
            };

            if let Err(err) = state.graph.start(task_id, slot.worker_id, now) {
                warn!(%task_id, error = %err, "task could not start");
                self.release_slot(slot.worker_id).await;
                continue;
            }
            self.flush_changes(&mut state);
            self.inner.events.emit(crate::domain::DomainEvent::TaskAssigned {
                task_id,
                worker_id: slot.worker_id,
            });
            info!(%task_id, worker_id = %slot.worker_id, reused = slot.reused, "task assigned");

            if let Some(assignment) = self.assignment(&state, task_id, slot.worker_id) {
                self.dispatch(slot.worker, assignment);
                report.assigned.push((task_id, slot.worker_id));
            }
        }
        self.flush_changes(&mut state);
        report
    }

    /// Whether the ASYNC blocker deprioritizing `task_id` is still PENDING.
    /// A blocker found final is cleared here (its answer joins the context).
    async fn async_wait_pending(&self, state: &mut State, task_id: TaskId, blocker_id: BlockerId) -> bool {
        match self.inner.blockers.get(blocker_id).await {
            Ok(blocker) if blocker.is_pending() => true,
            Ok(blocker) => {
                state.async_waits.remove(&task_id);
                if let Some(answer) = blocker.answer {
                    state.contexts.entry(task_id).or_default().push_answer(BlockerAnswer {
                        blocker_id,
                        question: blocker.question,
                        answer,
                    });
                }
                false
            }
            Err(_) => {
                state.async_waits.remove(&task_id);
                false
            }
        }
    }

    pub(super) fn assignment(&self, state: &State, task_id: TaskId, worker_id: WorkerId) -> Option<Assignment> {
        let task = state.graph.get(task_id)?.clone();
        Some(Assignment {
            task,
            worker_id,
            context: state.contexts.get(&task_id).cloned().unwrap_or_default(),
            stop: self.inner.stop_tx.subscribe(),
        })
    }

    /// Run the execution on its own tokio task. No lock is held while the
    /// worker runs.
    pub(super) fn dispatch(&self, worker: Arc<dyn Worker>, assignment: Assignment) {
        let guard = InFlight::enter(&self.inner);
        tokio::spawn(self.clone().execute(worker, assignment, guard));
    }

    fn execute(self, worker: Arc<dyn Worker>, assignment: Assignment, guard: InFlight) -> BoxFuture {
        Box::pin(async move {
            let _guard = guard;
            let worker_id = assignment.worker_id;
            let task_id = assignment.task.id;

            let outcome = match tokio::spawn(async move { worker.execute(assignment).await }).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(%worker_id, %task_id, error = %err, "worker crashed, retiring its slot");
                    if let Err(err) = self.inner.pool.retire(worker_id).await {
                        warn!(%worker_id, error = %err, "retire failed");
                    }
                    Outcome::failure(format!("worker crashed: {err}"))
                }
            };
            self.apply_outcome(worker_id, task_id, outcome).await;
        })
    }

    pub(super) async fn release_slot(&self, worker_id: WorkerId) {
        match self.inner.pool.release(worker_id).await {
            Ok(()) => {}
            Err(PoolError::UnknownSlot(_)) => debug!(%worker_id, "slot already retired"),
            Err(err) => warn!(%worker_id, error = %err, "release failed"),
        }
    }

    // ========================================
    // Outcomes
    // ========================================

    /// Apply a worker's report for `task_id`.
    ///
    /// - A worker suspended while it was running has reached its checkpoint;
    ///   the report itself is dropped.
    /// - An outcome for a task that is no longer `in_progress` on this worker
    ///   (expired blocker, external pause) is discarded and the slot released.
    /// - `STOPPED`, or a failure after `stop`, sends the task back to `pending`
    ///   without a retry decision.
    pub async fn apply_outcome(&self, worker_id: WorkerId, task_id: TaskId, outcome: Outcome) {
        let mut state = self.inner.state.lock().await;
        let now = self.inner.clock.now();

        if let Some(after) = state.checkpoints.remove(&worker_id) {
            debug!(%task_id, %worker_id, kind = ?outcome.kind, "suspended worker returned");
            if let Err(err) = self.reach_checkpoint(&mut state, worker_id, after, now).await {
                error!(%task_id, %worker_id, error = %err, "failed to apply checkpoint");
            }
            self.flush_changes(&mut state);
            let stopped = state.stopped;
            drop(state);
            if !stopped {
                self.trigger();
            }
            return;
        }

        let current = state.graph.get(task_id).map(|t| (t.status, t.assigned_worker));
        if current != Some((TaskStatus::InProgress, Some(worker_id))) {
            warn!(%task_id, %worker_id, kind = ?outcome.kind, "task no longer running on this worker, outcome discarded");
            self.release_slot(worker_id).await;
            return;
        }
        if let Some(progress) = outcome.progress {
            let _ = state.graph.set_progress(task_id, progress);
        }

        let result = match outcome.kind {
            OutcomeKind::Success => self.complete(&mut state, worker_id, task_id, now).await,
            OutcomeKind::Stopped => self.interrupt(&mut state, worker_id, task_id, now).await,
            OutcomeKind::Failure if state.stopped => self.interrupt(&mut state, worker_id, task_id, now).await,
            OutcomeKind::Failure => {
                self.handle_failure(&mut state, worker_id, task_id, &outcome, now, true)
                    .await
            }
            OutcomeKind::Blocked => match &outcome.blocker {
                Some(request) => match self
                    .inner
                    .blockers
                    .create(worker_id, Some(task_id), request.blocker_type, &request.question)
                    .await
                {
                    Ok(blocker) => self.park(&mut state, worker_id, task_id, &blocker, now).await,
                    Err(err) => {
                        warn!(%task_id, error = %err, "blocker rejected, counting as a failure");
                        let failure = Outcome::failure(format!("blocker rejected: {err}"));
                        self.handle_failure(&mut state, worker_id, task_id, &failure, now, false)
                            .await
                    }
                },
                None => {
                    let failure = Outcome::failure("blocked without a question");
                    self.handle_failure(&mut state, worker_id, task_id, &failure, now, false)
                        .await
                }
            },
        };
        if let Err(err) = result {
            error!(%task_id, %worker_id, error = %err, "failed to apply outcome");
        }

        self.flush_changes(&mut state);
        let stopped = state.stopped;
        drop(state);
        if !stopped {
            self.trigger();
        }
    }

    async fn complete(
        &self,
        state: &mut State,
        worker_id: WorkerId,
        task_id: TaskId,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), ForemanError> {
        let promoted = state.graph.mark_completed(task_id, now)?;
        state.contexts.remove(&task_id);
        state.async_waits.remove(&task_id);
        self.inner.pool.complete(worker_id).await?;
        info!(%task_id, %worker_id, promoted = promoted.len(), "task completed");
        Ok(())
    }

    /// The execution ended at a stop checkpoint: no retry is spent and the
    /// task waits in `pending` for the next run.
    async fn interrupt(
        &self,
        state: &mut State,
        worker_id: WorkerId,
        task_id: TaskId,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), ForemanError> {
        state.graph.set_status(task_id, TaskStatus::Pending, now)?;
        self.release_slot(worker_id).await;
        info!(%task_id, %worker_id, "execution interrupted, task back to pending");
        Ok(())
    }

    /// Retry, give up, or escalate to a human.
    ///
    /// The decider sees the task with its retry counter already bumped; an
    /// escalation does not consume a retry.
    async fn handle_failure(
        &self,
        state: &mut State,
        worker_id: WorkerId,
        task_id: TaskId,
        outcome: &Outcome,
        now: chrono::DateTime<chrono::Utc>,
        allow_escalation: bool,
    ) -> Result<(), ForemanError> {
        let mut attempted = state
            .graph
            .get(task_id)
            .cloned()
            .ok_or(GraphError::UnknownTask(task_id))?;
        attempted.retry_count += 1;
        let error = outcome.reason.clone();
        let trigger = serde_json::json!({
            "outcome": outcome.kind,
            "reason": error,
            "retry_count": attempted.retry_count,
        });

        let decision = match self.inner.decider.decide(&attempted, outcome) {
            Decision::Escalate { question } => {
                if allow_escalation {
                    match self
                        .inner
                        .blockers
                        .create(worker_id, Some(task_id), BlockerType::Sync, &question)
                        .await
                    {
                        Ok(blocker) => {
                            self.record_decision(state, task_id, trigger, "escalation", "escalate", now);
                            info!(%task_id, blocker_id = %blocker.id, "failure escalated to a human");
                            return self.park(state, worker_id, task_id, &blocker, now).await;
                        }
                        Err(err) => warn!(%task_id, error = %err, "escalation rejected"),
                    }
                }
                let reason = format!("escalation not possible: {question}");
                if attempted.retry_count >= self.inner.config.max_retries {
                    Decision::MarkFailed { reason }
                } else {
                    Decision::Retry { reason }
                }
            }
            other => other,
        };

        let task = state.graph.record_failure(task_id, error.clone())?;
        self.record_decision(state, task_id, trigger, self.inner.decider.policy(), decision.label(), now);

        match decision {
            Decision::Retry { reason } => {
                state.graph.set_status(task_id, TaskStatus::Ready, now)?;
                self.release_slot(worker_id).await;
                info!(%task_id, retry_count = task.retry_count, %reason, "task will be retried");
            }
            // an Escalate reaching here has already been turned into retry / fail above
            Decision::MarkFailed { reason } | Decision::Escalate { question: reason } => {
                let blocked = state.graph.fail(
                    task_id,
                    FailureReason::RetryExceeded {
                        attempts: task.retry_count,
                        last_error: error,
                    },
                    None,
                    now,
                )?;
                self.release_slot(worker_id).await;
                warn!(%task_id, %reason, blocked = blocked.len(), "task failed");
            }
        }
        Ok(())
    }

    /// Park a task on a freshly created blocker.
    ///
    /// SYNC: the task and everything downstream pause; the worker keeps its
    /// slot (blocked) and is recorded as suspended until the answer arrives.
    /// ASYNC: the task goes back to `ready` behind other work and the slot is freed.
    pub(super) async fn park(
        &self,
        state: &mut State,
        worker_id: WorkerId,
        task_id: TaskId,
        blocker: &Blocker,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), ForemanError> {
        match blocker.blocker_type {
            BlockerType::Sync => {
                let paused = state.graph.pause_closure(task_id, blocker.id, now)?;
                if state.stopped {
                    self.release_slot(worker_id).await;
                    return Ok(());
                }
                self.inner.pool.mark_blocked(worker_id, blocker.id).await?;
                let context = state.contexts.get(&task_id).cloned().unwrap_or_default();
                state.suspended.insert(
                    blocker.id,
                    SuspendedTask {
                        task_id,
                        blocker_id: blocker.id,
                        worker_id,
                        context,
                        suspended_at: now,
                    },
                );
                info!(%task_id, blocker_id = %blocker.id, paused = paused.len(), "worker suspended on SYNC blocker");
                self.spawn_poll_fallback(blocker.id);
            }
            BlockerType::Async => {
                state.graph.set_status(task_id, TaskStatus::Ready, now)?;
                state.async_waits.insert(task_id, blocker.id);
                self.release_slot(worker_id).await;
                info!(%task_id, blocker_id = %blocker.id, "task deprioritized by ASYNC blocker");
            }
        }
        Ok(())
    }
}
