//! Blocker lifecycle as seen by the task graph.
//!
//! Two independent paths can observe a resolution: the push path
//! (`resolve_blocker`) and the poll fallback every suspended worker runs.
//! Both end in `apply_resolution`, which is idempotent, so whichever arrives
//! first does the work and the other finds nothing left to do.

use tracing::{debug, info, warn};

use super::scheduling::BoxFuture;
use super::{AfterCheckpoint, Coordinator, State, SuspendedTask};
use crate::blocker::ResolveOutcome;
use crate::domain::{
    Blocker, BlockerError, BlockerId, BlockerStatus, BlockerType, DomainEvent, FailureReason, ForemanError,
    TaskId, TaskStatus, WorkerId,
};
use crate::ports::BlockerAnswer;

impl Coordinator {
    /// Raise a blocker on behalf of a worker outside its execution result.
    ///
    /// SYNC pauses the task and every non-terminal task downstream of it. When
    /// the task is running on `worker_id`, that worker is suspended on its slot
    /// like a BLOCKED outcome would. ASYNC only deprioritizes the task.
    pub async fn create_blocker(
        &self,
        worker_id: WorkerId,
        task_id: Option<TaskId>,
        blocker_type: BlockerType,
        question: &str,
    ) -> Result<Blocker, ForemanError> {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock().await;
        if let Some(id) = task_id
            && state.graph.get(id).is_none()
        {
            return Err(BlockerError::UnknownTask(id).into());
        }

        let blocker = self
            .inner
            .blockers
            .create(worker_id, task_id, blocker_type, question)
            .await?;

        if let Some(id) = task_id {
            match blocker_type {
                BlockerType::Sync if running_on(&state, id, worker_id) => {
                    // the execution is still going; its return is the checkpoint
                    self.park(&mut state, worker_id, id, &blocker, now).await?;
                    if !state.stopped {
                        state.checkpoints.insert(worker_id, AfterCheckpoint::Hold);
                    }
                }
                BlockerType::Sync => {
                    let paused = state.graph.pause_closure(id, blocker.id, now)?;
                    debug!(task_id = %id, blocker_id = %blocker.id, paused = paused.len(), "tasks paused");
                    self.spawn_poll_fallback(blocker.id);
                }
                BlockerType::Async => {
                    if state.graph.get(id).is_some_and(|t| !t.status.is_terminal()) {
                        state.async_waits.insert(id, blocker.id);
                    }
                }
            }
        }
        self.flush_changes(&mut state);
        Ok(blocker)
    }

    /// Answer a blocker. Only the call that wins the conditional update
    /// applies the resolution; later calls get `AlreadyResolved`.
    pub async fn resolve_blocker(&self, blocker_id: BlockerId, answer: &str) -> Result<ResolveOutcome, ForemanError> {
        let outcome = self.inner.blockers.resolve(blocker_id, answer).await?;
        if matches!(outcome, ResolveOutcome::Resolved(_)) {
            self.apply_resolution(blocker_id).await?;
        }
        Ok(outcome)
    }

    /// Bring the graph in line with a RESOLVED blocker.
    ///
    /// - the suspended worker (if any) resumes in place with the answer in its context
    /// - other tasks paused by the blocker go back to `pending`
    /// - an ASYNC wait on the blocker is lifted
    ///
    /// Returns whether anything changed; calling it again is a no-op.
    pub async fn apply_resolution(&self, blocker_id: BlockerId) -> Result<bool, ForemanError> {
        let mut state = self.inner.state.lock().await;
        let blocker = self.inner.blockers.get(blocker_id).await?;
        let Some(answer) = blocker.answer.clone().filter(|_| blocker.status == BlockerStatus::Resolved) else {
            return Ok(false);
        };
        let now = self.inner.clock.now();
        let entry = BlockerAnswer {
            blocker_id,
            question: blocker.question.clone(),
            answer,
        };
        let mut applied = false;

        if let Some(mut suspended) = state.suspended.remove(&blocker_id) {
            applied = true;
            suspended.context.push_answer(entry.clone());
            state.contexts.insert(suspended.task_id, suspended.context.clone());
            self.resume_in_place(&mut state, suspended, now).await?;
        }

        // a task whose worker has not returned yet stays paused until it does
        let held = state.checkpoints.values().find_map(|after| match after {
            AfterCheckpoint::Resume(s) if s.blocker_id == blocker_id => Some(s.task_id),
            _ => None,
        });
        let mut paused = state.graph.paused_by(blocker_id);
        paused.retain(|id| Some(*id) != held);
        for id in &paused {
            state.graph.set_status(*id, TaskStatus::Pending, now)?;
        }
        applied |= !paused.is_empty();

        if let Some(task_id) = blocker.task_id {
            if state.async_waits.get(&task_id) == Some(&blocker_id) {
                state.async_waits.remove(&task_id);
                applied = true;
            }
            if applied {
                state.contexts.entry(task_id).or_default().push_answer(entry);
            }
        }

        self.flush_changes(&mut state);
        drop(state);
        if applied {
            info!(%blocker_id, released = paused.len(), "blocker resolution applied");
            self.trigger();
        }
        Ok(applied)
    }

    /// Re-enter the suspended worker on its held slot. If that is no longer
    /// possible (stopped, slot lost) the task goes back to the scheduler.
    ///
    /// A worker that has not reached its checkpoint yet resumes when it does.
    pub(super) async fn resume_in_place(
        &self,
        state: &mut State,
        suspended: SuspendedTask,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), ForemanError> {
        let (task_id, blocker_id, worker_id) = (suspended.task_id, suspended.blocker_id, suspended.worker_id);
        let still_paused = state
            .graph
            .get(task_id)
            .is_some_and(|t| t.status == TaskStatus::Paused && t.blocker_id == Some(blocker_id));
        if !still_paused {
            self.release_held(state, worker_id).await;
            return Ok(());
        }
        if state.stopped {
            state.graph.set_status(task_id, TaskStatus::Pending, now)?;
            return Ok(());
        }
        if let Some(after) = state.checkpoints.get_mut(&worker_id) {
            debug!(%task_id, %worker_id, "answer arrived before the checkpoint, resuming on return");
            *after = AfterCheckpoint::Resume(suspended);
            return Ok(());
        }

        let worker = match self.inner.pool.resume(worker_id, task_id).await {
            Ok(worker) => worker,
            Err(err) => {
                warn!(%task_id, %worker_id, error = %err, "cannot resume on the held slot, rescheduling");
                state.graph.set_status(task_id, TaskStatus::Pending, now)?;
                return Ok(());
            }
        };
        state.graph.start(task_id, worker_id, now)?;
        self.flush_changes(state);
        self.inner.events.emit(DomainEvent::AgentResumed {
            worker_id,
            task_id,
            blocker_id,
        });
        info!(%task_id, %worker_id, %blocker_id, "worker resumed");

        if let Some(assignment) = self.assignment(state, task_id, worker_id) {
            self.dispatch(worker, assignment);
        }
        Ok(())
    }

    /// Bring the graph in line with an EXPIRED blocker: the asking task fails,
    /// tasks paused by the blocker become `blocked`, a held slot is released.
    ///
    /// Returns whether anything changed; calling it again is a no-op.
    pub async fn apply_expiry(&self, blocker: &Blocker) -> Result<bool, ForemanError> {
        let mut state = self.inner.state.lock().await;
        let now = self.inner.clock.now();
        let mut applied = false;

        if let Some(suspended) = state.suspended.remove(&blocker.id) {
            self.release_held(&mut state, suspended.worker_id).await;
            applied = true;
        }
        state.async_waits.retain(|_, b| *b != blocker.id);

        if let Some(task_id) = blocker.task_id
            && state.graph.get(task_id).is_some_and(|t| !t.status.is_terminal())
        {
            let blocked = state.graph.fail(
                task_id,
                FailureReason::BlockerExpired { blocker_id: blocker.id },
                Some(blocker.id),
                now,
            )?;
            self.record_decision(
                &mut state,
                task_id,
                serde_json::json!({ "blocker_id": blocker.id, "status": blocker.status }),
                "blocker_expiry",
                "fail_on_expiry",
                now,
            );
            warn!(%task_id, blocker_id = %blocker.id, blocked = blocked.len(), "task failed on expired blocker");
            applied = true;
        }

        for id in state.graph.paused_by(blocker.id) {
            state.graph.set_status(id, TaskStatus::Blocked, now)?;
            applied = true;
        }

        self.flush_changes(&mut state);
        Ok(applied)
    }

    /// Free a held slot now, or when its still-running worker returns.
    async fn release_held(&self, state: &mut State, worker_id: WorkerId) {
        match state.checkpoints.get_mut(&worker_id) {
            Some(after) => *after = AfterCheckpoint::Release,
            None => self.release_slot(worker_id).await,
        }
    }

    /// Expire every PENDING blocker older than the configured timeout and
    /// apply each expiry. Returns the blockers expired by this sweep.
    pub async fn expire_stale_blockers(&self) -> Vec<BlockerId> {
        let expired = self
            .inner
            .blockers
            .expire_stale(self.inner.config.blocker_timeout())
            .await;
        for blocker in &expired {
            if let Err(err) = self.apply_expiry(blocker).await {
                warn!(blocker_id = %blocker.id, error = %err, "failed to apply expiry");
            }
        }
        expired.into_iter().map(|b| b.id).collect()
    }

    /// Apply what was decided for a worker while it was still running.
    pub(super) async fn reach_checkpoint(
        &self,
        state: &mut State,
        worker_id: WorkerId,
        after: AfterCheckpoint,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), ForemanError> {
        match after {
            AfterCheckpoint::Hold => {
                debug!(%worker_id, "worker reached its checkpoint, slot stays blocked");
                Ok(())
            }
            AfterCheckpoint::Resume(suspended) => self.resume_in_place(state, suspended, now).await,
            AfterCheckpoint::Release => {
                self.release_slot(worker_id).await;
                Ok(())
            }
        }
    }

    // ========================================
    // Poll fallback
    // ========================================

    pub(super) fn spawn_poll_fallback(&self, blocker_id: BlockerId) {
        tokio::spawn(self.clone().poll_blocker(blocker_id));
    }

    /// Re-read the blocker every poll interval until it is final, then apply
    /// it. Ends early on stop.
    fn poll_blocker(self, blocker_id: BlockerId) -> BoxFuture {
        Box::pin(async move {
            let mut stop_rx = self.inner.stop_tx.subscribe();
            let mut ticker = tokio::time::interval(self.inner.config.poll_interval());
            ticker.tick().await;

            loop {
                if *stop_rx.borrow() {
                    return;
                }
                tokio::select! {
                    _ = stop_rx.changed() => continue,
                    _ = ticker.tick() => {}
                }

                let blocker = match self.inner.blockers.get(blocker_id).await {
                    Ok(blocker) => blocker,
                    Err(err) => {
                        warn!(%blocker_id, error = %err, "poll fallback gave up");
                        return;
                    }
                };
                let result = match blocker.status {
                    BlockerStatus::Pending => continue,
                    BlockerStatus::Resolved => self.apply_resolution(blocker_id).await,
                    BlockerStatus::Expired => self.apply_expiry(&blocker).await,
                };
                match result {
                    Ok(true) => debug!(%blocker_id, status = %blocker.status, "poll fallback applied blocker"),
                    Ok(false) => {}
                    Err(err) => warn!(%blocker_id, error = %err, "poll fallback failed"),
                }
                return;
            }
        })
    }
}

fn running_on(state: &State, task_id: TaskId, worker_id: WorkerId) -> bool {
    state
        .graph
        .get(task_id)
        .is_some_and(|t| t.status == TaskStatus::InProgress && t.assigned_worker == Some(worker_id))
}
