//! foreman-core
//!
//! Task orchestration and blocker resolution for a small team of AI workers.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, blocker, slot, outcome, decision, events, errors）
//! - **ports**: 抽象化レイヤー（Clock, IdGenerator, EventSink, BlockerStore, Worker, SnapshotSource）
//! - **graph**: 依存グラフとタスク状態（サイクル検出・readiness）
//! - **pool**: ロール別ワーカースロットの上限付きプール
//! - **blocker**: blocker の作成・解決・期限切れ・分類
//! - **coordinator**: スケジューリングループと blocker 解決の中心
//! - **sync**: push（SyncHub）と poll を突き合わせる observer
//! - **api**: 外部メッセージの形（トランスポートなし）
//! - **app**: 構築・バックグラウンドループ・ステータス
//! - **impls**: 開発・テスト用の実装（InMemoryBlockerStore, ScriptedWorkerFactory）

pub mod api;
pub mod app;
pub mod blocker;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod graph;
pub mod impls;
pub mod pool;
pub mod ports;
pub mod sync;

pub use app::{App, AppBuilder};
pub use config::ForemanConfig;
pub use coordinator::Coordinator;
