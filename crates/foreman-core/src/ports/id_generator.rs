//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）
//! - **SequentialIdGenerator**: 1, 2, 3... の決定的な ID（テスト・デモ用）

use std::sync::atomic::{AtomicU64, Ordering};

use ulid::Ulid;

use crate::domain::ids::{BlockerId, Id, IdMarker, ProjectId, TaskId, WorkerId};
use crate::ports::Clock;

/// IdGenerator はエンティティ ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（Coordinator / Pool / BlockerService で共有する）
pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;
    fn generate_worker_id(&self) -> WorkerId;
    fn generate_blocker_id(&self) -> BlockerId;
    fn generate_project_id(&self) -> ProjectId;
}

/// UlidGenerator は Clock の現在時刻をタイムスタンプ部に使う ULID 生成器
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next<T: IdMarker>(&self) -> Id<T> {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Id::from_ulid(Ulid::from_parts(timestamp_ms, rand::random()))
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        self.next()
    }

    fn generate_worker_id(&self) -> WorkerId {
        self.next()
    }

    fn generate_blocker_id(&self) -> BlockerId {
        self.next()
    }

    fn generate_project_id(&self) -> ProjectId {
        self.next()
    }
}

/// 単調増加カウンタによる ID（全種類で共通のカウンタ）
///
/// 生成順 = ソート順になるので、ready_tasks() の順序などをテストで固定できる。
#[derive(Debug, Default)]
pub struct SequentialIdGenerator {
    next: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    fn next<T: IdMarker>(&self) -> Id<T> {
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        Id::from_raw(n as u128)
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn generate_task_id(&self) -> TaskId {
        self.next()
    }

    fn generate_worker_id(&self) -> WorkerId {
        self.next()
    }

    fn generate_blocker_id(&self) -> BlockerId {
        self.next()
    }

    fn generate_project_id(&self) -> ProjectId {
        self.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(SystemClock);

        let id1 = id_gen.generate_task_id();
        let id2 = id_gen.generate_task_id();
        assert_ne!(id1, id2);
    }

    #[test]
    fn ulid_generator_uses_clock_timestamp() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(fixed_time));

        let id = id_gen.generate_blocker_id();
        let timestamp = (id.as_ulid().0 >> 80) as u64;
        assert_eq!(timestamp, fixed_time.timestamp_millis() as u64);
    }

    #[test]
    fn sequential_ids_sort_in_generation_order() {
        let id_gen = SequentialIdGenerator::new();
        let a = id_gen.generate_task_id();
        let _w = id_gen.generate_worker_id();
        let b = id_gen.generate_task_id();
        assert!(a < b);
        assert_eq!(a, TaskId::from_raw(1));
        assert_eq!(b, TaskId::from_raw(3));
    }
}
