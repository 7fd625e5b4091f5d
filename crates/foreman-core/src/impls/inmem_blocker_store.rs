//! In-memory BlockerStore.
//!
//! Design:
//! - One coarse lock over the whole table (single-digit concurrent blockers).
//! - Conditional updates check the status inside the lock, so racing
//!   `resolve_if_pending` calls see exactly one `Applied`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{Blocker, BlockerError, BlockerId, BlockerStatus, WorkerId};
use crate::ports::{BlockerStore, ConditionalUpdate};

#[derive(Default)]
struct InMemoryBlockerState {
    rows: HashMap<BlockerId, Blocker>,
}

impl InMemoryBlockerState {
    fn sorted(&self, mut rows: Vec<Blocker>, newest_first: bool) -> Vec<Blocker> {
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if newest_first {
            rows.reverse();
        }
        rows
    }

    fn update_if_pending(
        &mut self,
        id: BlockerId,
        apply: impl FnOnce(&mut Blocker) -> bool,
    ) -> Result<ConditionalUpdate, BlockerError> {
        let row = self.rows.get_mut(&id).ok_or(BlockerError::NotFound(id))?;
        if apply(row) {
            Ok(ConditionalUpdate::Applied(row.clone()))
        } else {
            Ok(ConditionalUpdate::Rejected { status: row.status })
        }
    }
}

#[derive(Clone, Default)]
pub struct InMemoryBlockerStore {
    state: Arc<Mutex<InMemoryBlockerState>>,
}

impl InMemoryBlockerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlockerStore for InMemoryBlockerStore {
    async fn insert(&self, blocker: Blocker) -> Result<(), BlockerError> {
        let mut state = self.state.lock().await;
        state.rows.insert(blocker.id, blocker);
        Ok(())
    }

    async fn get(&self, id: BlockerId) -> Option<Blocker> {
        let state = self.state.lock().await;
        state.rows.get(&id).cloned()
    }

    async fn resolve_if_pending(
        &self,
        id: BlockerId,
        answer: String,
        at: DateTime<Utc>,
    ) -> Result<ConditionalUpdate, BlockerError> {
        let mut state = self.state.lock().await;
        state.update_if_pending(id, |row| row.resolve(answer, at))
    }

    async fn expire_if_pending(
        &self,
        id: BlockerId,
        at: DateTime<Utc>,
    ) -> Result<ConditionalUpdate, BlockerError> {
        let mut state = self.state.lock().await;
        state.update_if_pending(id, |row| row.expire(at))
    }

    async fn list(&self, status: Option<BlockerStatus>) -> Vec<Blocker> {
        let state = self.state.lock().await;
        let rows = state
            .rows
            .values()
            .filter(|b| status.is_none_or(|s| b.status == s))
            .cloned()
            .collect();
        state.sorted(rows, true)
    }

    async fn pending_created_before(&self, cutoff: DateTime<Utc>) -> Vec<Blocker> {
        let state = self.state.lock().await;
        let rows = state
            .rows
            .values()
            .filter(|b| b.is_pending() && b.created_at < cutoff)
            .cloned()
            .collect();
        state.sorted(rows, false)
    }

    async fn pending_for_worker(&self, worker_id: WorkerId) -> Vec<Blocker> {
        let state = self.state.lock().await;
        let rows = state
            .rows
            .values()
            .filter(|b| b.is_pending() && b.worker_id == worker_id)
            .cloned()
            .collect();
        state.sorted(rows, false)
    }

    async fn count_created_since(&self, worker_id: WorkerId, since: DateTime<Utc>) -> usize {
        let state = self.state.lock().await;
        state
            .rows
            .values()
            .filter(|b| b.worker_id == worker_id && b.created_at >= since)
            .count()
    }
}
