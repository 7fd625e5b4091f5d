//! ReaperLoop - 期限切れ blocker の回収
//!
//! # フロー
//! 1. `expiry_sweep_interval` ごとに起きる
//! 2. `Coordinator::expire_stale_blockers()` で timeout を過ぎた PENDING を EXPIRED にする
//! 3. 元タスクは failed、SYNC で止まっていた下流は blocked、保持スロットは解放
//!
//! 同じ blocker を二度 expire しないので、sweep が重なっても結果は変わりません。

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::coordinator::Coordinator;
use crate::domain::BlockerId;

pub struct ReaperLoop {
    coordinator: Coordinator,
    interval: Duration,
}

impl ReaperLoop {
    pub fn new(coordinator: Coordinator) -> Self {
        let interval = coordinator.config().expiry_sweep_interval();
        Self { coordinator, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One sweep; returns the blockers it expired.
    pub async fn sweep_once(&self) -> Vec<BlockerId> {
        let expired = self.coordinator.expire_stale_blockers().await;
        if expired.is_empty() {
            debug!("reaper sweep: nothing expired");
        } else {
            info!(expired = expired.len(), "reaper sweep expired blockers");
        }
        expired
    }

    /// Sweep on every tick until shutdown. The first sweep runs immediately.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_rx.wait_for(|stop| *stop) => break,
                _ = ticker.tick() => {}
            }
            self.sweep_once().await;
        }
        debug!("reaper loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForemanConfig;
    use crate::coordinator::testing::harness;
    use crate::domain::{BlockerStatus, BlockerType, WorkerId};

    #[tokio::test(start_paused = true)]
    async fn expires_stale_blockers_on_its_interval() {
        let h = harness(ForemanConfig::default(), &[]);
        let blocker = h
            .coordinator
            .create_blocker(WorkerId::from_raw(1), None, BlockerType::Async, "deploy window?")
            .await
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reaper = ReaperLoop::new(h.coordinator.clone()).with_interval(Duration::from_secs(60));
        let join = tokio::spawn(reaper.run(shutdown_rx));

        // first sweep: still fresh
        tokio::task::yield_now().await;
        assert!(h.coordinator.blockers().get(blocker.id).await.unwrap().is_pending());

        h.clock.advance(chrono::Duration::hours(25));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(
            h.coordinator.blockers().get(blocker.id).await.unwrap().status,
            BlockerStatus::Expired
        );

        shutdown_tx.send(true).unwrap();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn sweep_once_is_idempotent() {
        let h = harness(ForemanConfig::default(), &[]);
        h.coordinator
            .create_blocker(WorkerId::from_raw(1), None, BlockerType::Sync, "approve?")
            .await
            .unwrap();
        h.clock.advance(chrono::Duration::hours(25));

        let reaper = ReaperLoop::new(h.coordinator.clone());
        assert_eq!(reaper.sweep_once().await.len(), 1);
        assert!(reaper.sweep_once().await.is_empty());
    }
}
