//! App - アプリケーション層
//!
//! Coordinator と push 経路を組み合わせ、バックグラウンドループを管理します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: 構築とワイヤリング（起動時検証つき）
//! - **App**: Coordinator のスケジューリングループと ReaperLoop を起動・停止
//! - **ReaperLoop**: 期限切れ blocker の回収
//! - **StatusReport**: 状態別の集計と詰まり理由

pub mod builder;
pub mod reaper_loop;
pub mod status;

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::api::BlockerApi;
use crate::coordinator::Coordinator;
use crate::sync::{Observer, SyncHub};

pub use self::builder::{AppBuilder, BuildError};
pub use self::reaper_loop::ReaperLoop;
pub use self::status::StatusReport;

/// App handle.
/// - `spawn()` でスケジューリングループと ReaperLoop を起動
/// - `shutdown()` で両方を止め、スロットを解放して終了を待つ
pub struct App {
    coordinator: Coordinator,
    hub: Arc<SyncHub>,
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl App {
    pub(crate) fn new(coordinator: Coordinator, hub: Arc<SyncHub>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            coordinator,
            hub,
            shutdown_tx,
            joins: Vec::new(),
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn hub(&self) -> &Arc<SyncHub> {
        &self.hub
    }

    pub fn api(&self) -> BlockerApi {
        BlockerApi::new(self.coordinator.clone())
    }

    /// Attach an observer fed by this app's push channel and the coordinator.
    pub fn observe(&self) -> Observer {
        Observer::spawn(
            Arc::clone(&self.hub),
            Arc::new(self.coordinator.clone()),
            self.coordinator.config().poll_interval(),
        )
    }

    pub async fn status(&self) -> StatusReport {
        StatusReport::collect(&self.coordinator).await
    }

    /// Start the background loops. Calling it again is a no-op.
    pub fn spawn(&mut self) {
        if !self.joins.is_empty() {
            return;
        }
        let coordinator = self.coordinator.clone();
        self.joins.push(tokio::spawn(async move { coordinator.run().await }));

        let reaper = ReaperLoop::new(self.coordinator.clone());
        self.joins.push(tokio::spawn(reaper.run(self.shutdown_tx.subscribe())));
        info!(project_id = %self.coordinator.project_id(), "app started");
    }

    /// Stop both loops, release every slot, and wait for the loops to exit.
    /// Running worker executions are signaled, not aborted.
    pub async fn shutdown(self) {
        // ignore send error: the reaper may not have been spawned
        let _ = self.shutdown_tx.send(true);
        self.coordinator.stop().await;
        for j in self.joins {
            let _ = j.await;
        }
        info!(project_id = %self.coordinator.project_id(), "app stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;
    use crate::config::ForemanConfig;
    use crate::domain::{Role, TaskStatus};
    use crate::impls::ScriptedWorkerFactory;

    fn app() -> App {
        AppBuilder::new()
            .config(ForemanConfig {
                schedule_interval_ms: 10,
                ..ForemanConfig::default()
            })
            .register_all(Arc::new(ScriptedWorkerFactory::new(HashMap::new())))
            .unwrap()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn spawned_app_runs_a_chain_to_completion() {
        let mut app = app();
        let c = app.coordinator().clone();
        let a = c.add_task("a", Role::Backend, vec![]).await.unwrap();
        let b = c.add_task("b", Role::Test, vec![a]).await.unwrap();
        app.spawn();
        app.spawn();

        tokio::time::timeout(Duration::from_secs(5), async {
            while c.task(b).await.map(|t| t.status) != Some(TaskStatus::Completed) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        c.wait_idle().await;
        assert!(app.status().await.is_settled());
        app.shutdown().await;
        assert!(c.is_stopped().await);
        assert_eq!(c.occupancy().await.busy, 0);
    }

    #[tokio::test]
    async fn observer_sees_what_the_app_does() {
        let mut app = app();
        let observer = app.observe();
        let mut state = observer.state();
        state.wait_for(|s| s.resyncs() == 1).await.unwrap();

        let task = app.coordinator().add_task("a", Role::Backend, vec![]).await.unwrap();
        app.spawn();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| s.task(task).is_some_and(|t| t.status == TaskStatus::Completed)),
        )
        .await
        .unwrap()
        .unwrap();

        observer.shutdown_and_join().await;
        app.shutdown().await;
    }
}
