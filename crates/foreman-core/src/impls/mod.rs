//! Impls - ports の実装（開発・テスト用）
//!
//! - InMemoryBlockerStore: BlockerStore のインメモリ実装
//! - ScriptedWorkerFactory: タイトルごとのスクリプトで動くワーカー（CLI デモとテスト用）

pub mod inmem_blocker_store;
pub mod scripted;

pub use self::inmem_blocker_store::InMemoryBlockerStore;
pub use self::scripted::{ExecutionLog, Script, ScriptedQuestion, ScriptedWorkerFactory};
