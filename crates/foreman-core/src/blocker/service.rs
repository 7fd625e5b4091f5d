//! BlockerService - blocker の作成・解決・期限切れ
//!
//! Design:
//! - 状態遷移は BlockerStore の条件付き更新だけで決まる。
//!   同時に N 件の resolve が来ても Applied になるのは 1 件で、残りは AlreadyResolved。
//! - イベントは勝者だけが emit する（重複通知なし）。
//! - タスクへの影響（pause / resume / fail）は Coordinator の責務で、ここでは扱わない。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::classify::is_tactical;
use crate::domain::{
    Blocker, BlockerError, BlockerId, BlockerStatus, BlockerType, DomainEvent, Role, TaskId, WorkerId,
};
use crate::ports::{BlockerStore, Clock, ConditionalUpdate, EventSink, IdGenerator};

/// Validation and rate limits applied on create / resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockerLimits {
    pub question_max_len: usize,
    pub answer_max_len: usize,
    pub rate_limit_per_minute: u32,
}

impl Default for BlockerLimits {
    fn default() -> Self {
        Self {
            question_max_len: 2_000,
            answer_max_len: 5_000,
            rate_limit_per_minute: 10,
        }
    }
}

/// Result of a resolve attempt that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// This call won: the blocker is now RESOLVED.
    Resolved(Blocker),
    /// Someone else got there first (or it expired).
    AlreadyResolved { status: BlockerStatus },
}

/// A blocker row with the context a human needs to answer it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockerView {
    #[serde(flatten)]
    pub blocker: Blocker,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_title: Option<String>,
    pub time_waiting_ms: i64,
    /// The question looks like a routine choice rather than a real decision.
    pub tactical: bool,
}

impl BlockerView {
    pub fn new(
        blocker: Blocker,
        worker_role: Option<Role>,
        task_title: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let time_waiting_ms = blocker.waiting_ms(now);
        let tactical = is_tactical(&blocker.question);
        Self {
            blocker,
            worker_role,
            task_title,
            time_waiting_ms,
            tactical,
        }
    }
}

/// Aggregate numbers over every blocker in the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockerStats {
    pub total: usize,
    pub pending: usize,
    pub resolved: usize,
    pub expired: usize,
    pub sync_count: usize,
    pub async_count: usize,
    /// Mean of `resolved_at - created_at` over RESOLVED blockers.
    pub avg_resolution_time_seconds: Option<f64>,
    /// EXPIRED share of the blockers that reached a final state.
    pub expiration_rate_percent: f64,
}

/// How `wait_for_resolution` ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Answered(String),
    Expired,
    TimedOut,
}

pub struct BlockerService {
    store: Arc<dyn BlockerStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    events: Arc<dyn EventSink>,
    limits: BlockerLimits,
}

impl BlockerService {
    pub fn new(
        store: Arc<dyn BlockerStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        events: Arc<dyn EventSink>,
        limits: BlockerLimits,
    ) -> Self {
        Self {
            store,
            clock,
            ids,
            events,
            limits,
        }
    }

    pub fn limits(&self) -> BlockerLimits {
        self.limits
    }

    // ========================================
    // Commands
    // ========================================

    /// Insert a PENDING blocker after validating the question and the
    /// per-worker rate limit.
    pub async fn create(
        &self,
        worker_id: WorkerId,
        task_id: Option<TaskId>,
        blocker_type: BlockerType,
        question: &str,
    ) -> Result<Blocker, BlockerError> {
        let len = question.chars().count();
        if question.trim().is_empty() || len > self.limits.question_max_len {
            return Err(BlockerError::InvalidQuestion {
                len,
                max: self.limits.question_max_len,
            });
        }

        let now = self.clock.now();
        let since = now - chrono::Duration::seconds(60);
        let recent = self.store.count_created_since(worker_id, since).await;
        if recent >= self.limits.rate_limit_per_minute as usize {
            warn!(%worker_id, recent, "blocker rate limit hit");
            return Err(BlockerError::RateLimited {
                worker_id,
                limit: self.limits.rate_limit_per_minute,
            });
        }

        let blocker = Blocker::new(
            self.ids.generate_blocker_id(),
            worker_id,
            task_id,
            blocker_type,
            question,
            now,
        );
        self.store.insert(blocker.clone()).await?;
        info!(
            blocker_id = %blocker.id,
            %worker_id,
            blocker_type = %blocker_type,
            "blocker created"
        );
        self.events.emit(DomainEvent::BlockerCreated {
            blocker: blocker.clone(),
        });
        Ok(blocker)
    }

    /// PENDING -> RESOLVED with `answer`. Exactly one concurrent caller gets
    /// `Resolved`; the rest get `AlreadyResolved`.
    pub async fn resolve(&self, blocker_id: BlockerId, answer: &str) -> Result<ResolveOutcome, BlockerError> {
        let len = answer.chars().count();
        if answer.trim().is_empty() || len > self.limits.answer_max_len {
            return Err(BlockerError::InvalidAnswer {
                len,
                max: self.limits.answer_max_len,
            });
        }

        let now = self.clock.now();
        match self
            .store
            .resolve_if_pending(blocker_id, answer.to_string(), now)
            .await?
        {
            ConditionalUpdate::Applied(blocker) => {
                info!(%blocker_id, "blocker resolved");
                self.events.emit(DomainEvent::BlockerResolved {
                    blocker_id,
                    task_id: blocker.task_id,
                    answer: answer.to_string(),
                });
                Ok(ResolveOutcome::Resolved(blocker))
            }
            ConditionalUpdate::Rejected { status } => {
                debug!(%blocker_id, %status, "resolve lost the race");
                Ok(ResolveOutcome::AlreadyResolved { status })
            }
        }
    }

    /// Expire every PENDING blocker created more than `timeout` ago.
    ///
    /// Returns only the blockers this call expired, so a second sweep over the
    /// same rows returns nothing.
    pub async fn expire_stale(&self, timeout: chrono::Duration) -> Vec<Blocker> {
        let now = self.clock.now();
        let candidates = self.store.pending_created_before(now - timeout).await;

        let mut expired = Vec::new();
        for candidate in candidates {
            match self.store.expire_if_pending(candidate.id, now).await {
                Ok(ConditionalUpdate::Applied(blocker)) => {
                    info!(blocker_id = %blocker.id, "blocker expired");
                    self.events.emit(DomainEvent::BlockerExpired {
                        blocker_id: blocker.id,
                        task_id: blocker.task_id,
                    });
                    expired.push(blocker);
                }
                Ok(ConditionalUpdate::Rejected { .. }) => {}
                Err(err) => warn!(blocker_id = %candidate.id, error = %err, "expire failed"),
            }
        }
        expired
    }

    // ========================================
    // Queries
    // ========================================

    pub async fn get(&self, blocker_id: BlockerId) -> Result<Blocker, BlockerError> {
        self.store
            .get(blocker_id)
            .await
            .ok_or(BlockerError::NotFound(blocker_id))
    }

    /// Newest first.
    pub async fn list(&self, status: Option<BlockerStatus>) -> Vec<Blocker> {
        self.store.list(status).await
    }

    /// The oldest PENDING blocker raised by `worker_id`.
    pub async fn pending_for_worker(&self, worker_id: WorkerId) -> Option<Blocker> {
        self.store.pending_for_worker(worker_id).await.into_iter().next()
    }

    pub async fn stats(&self) -> BlockerStats {
        let rows = self.store.list(None).await;
        let mut stats = BlockerStats {
            total: rows.len(),
            ..BlockerStats::default()
        };
        let mut resolution_secs = Vec::new();
        for b in &rows {
            match b.status {
                BlockerStatus::Pending => stats.pending += 1,
                BlockerStatus::Resolved => {
                    stats.resolved += 1;
                    if let Some(at) = b.resolved_at {
                        resolution_secs.push((at - b.created_at).num_milliseconds() as f64 / 1000.0);
                    }
                }
                BlockerStatus::Expired => stats.expired += 1,
            }
            match b.blocker_type {
                BlockerType::Sync => stats.sync_count += 1,
                BlockerType::Async => stats.async_count += 1,
            }
        }
        if !resolution_secs.is_empty() {
            stats.avg_resolution_time_seconds =
                Some(resolution_secs.iter().sum::<f64>() / resolution_secs.len() as f64);
        }
        let finished = stats.resolved + stats.expired;
        if finished > 0 {
            stats.expiration_rate_percent = stats.expired as f64 * 100.0 / finished as f64;
        }
        stats
    }

    /// Poll the store until the blocker reaches a final state or `timeout` passes.
    pub async fn wait_for_resolution(
        &self,
        blocker_id: BlockerId,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<WaitOutcome, BlockerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let blocker = self.get(blocker_id).await?;
            match blocker.status {
                BlockerStatus::Resolved => {
                    return Ok(WaitOutcome::Answered(blocker.answer.unwrap_or_default()));
                }
                BlockerStatus::Expired => return Ok(WaitOutcome::Expired),
                BlockerStatus::Pending => {}
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(WaitOutcome::TimedOut);
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }
}
