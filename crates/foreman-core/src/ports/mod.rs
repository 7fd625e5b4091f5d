//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」を定義します。
//! グローバルな共有状態は持たず、すべてのハンドルは Coordinator の構築時に渡されます。

pub mod blocker_store;
pub mod clock;
pub mod event_sink;
pub mod id_generator;
pub mod snapshot;
pub mod worker;

pub use self::blocker_store::{BlockerStore, ConditionalUpdate};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::{EventSink, NoopEventSink};
pub use self::id_generator::{IdGenerator, SequentialIdGenerator, UlidGenerator};
pub use self::snapshot::{Snapshot, SnapshotSource};
pub use self::worker::{Assignment, BlockerAnswer, WorkContext, Worker, WorkerFactory};
