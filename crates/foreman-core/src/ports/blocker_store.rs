//! BlockerStore port - Blocker の永続化
//!
//! 「exactly one resolution wins」の唯一の仕組みは条件付き更新です。
//! SQL なら `UPDATE blockers SET ... WHERE id = ? AND status = 'PENDING'` に相当し、
//! 分散ロックは使いません。
//!
//! # 実装
//! - InMemoryBlockerStore (`crate::impls`)

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Blocker, BlockerError, BlockerId, BlockerStatus, WorkerId};

/// 条件付き更新の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionalUpdate {
    /// PENDING だったので更新した（更新後の行）
    Applied(Blocker),
    /// すでに最終状態だったので何もしなかった
    Rejected { status: BlockerStatus },
}

#[async_trait]
pub trait BlockerStore: Send + Sync {
    async fn insert(&self, blocker: Blocker) -> Result<(), BlockerError>;

    async fn get(&self, id: BlockerId) -> Option<Blocker>;

    /// PENDING -> RESOLVED, only if still PENDING.
    async fn resolve_if_pending(
        &self,
        id: BlockerId,
        answer: String,
        at: DateTime<Utc>,
    ) -> Result<ConditionalUpdate, BlockerError>;

    /// PENDING -> EXPIRED, only if still PENDING.
    async fn expire_if_pending(
        &self,
        id: BlockerId,
        at: DateTime<Utc>,
    ) -> Result<ConditionalUpdate, BlockerError>;

    /// Newest first. `None` returns every status.
    async fn list(&self, status: Option<BlockerStatus>) -> Vec<Blocker>;

    /// PENDING blockers created strictly before `cutoff`.
    async fn pending_created_before(&self, cutoff: DateTime<Utc>) -> Vec<Blocker>;

    /// Oldest first.
    async fn pending_for_worker(&self, worker_id: WorkerId) -> Vec<Blocker>;

    async fn count_created_since(&self, worker_id: WorkerId, since: DateTime<Utc>) -> usize;
}
