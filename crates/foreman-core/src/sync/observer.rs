//! Observer - push と poll を 1 つの consumer で突き合わせる
//!
//! Design:
//! - producer は 2 つ。push forwarder（broadcast の購読）と poll producer（interval で blocker を再読込）。
//!   どちらも同じ mpsc に `Update` を送るだけで、状態は持たない。
//! - consumer は 1 つだけ。`DerivedState::apply` が冪等なので、同じ変化が両方から届いても問題ない。
//! - 起動時と push の取りこぼし（Lagged）時は snapshot で full resync する。
//!   購読してから snapshot を取るので、その間のイベントは後から届いて収束する。
//! - 現在の状態は `watch` で公開する。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::hub::SyncHub;
use super::state::{DerivedState, Update};
use crate::ports::SnapshotSource;

const UPDATE_BUFFER: usize = 64;

/// Observer handle.
/// - `state()` で最新の DerivedState を購読できる
/// - `shutdown_and_join()` で producer を止めて consumer の終了を待つ
pub struct Observer {
    state: watch::Receiver<DerivedState>,
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl Observer {
    pub fn spawn(hub: Arc<SyncHub>, source: Arc<dyn SnapshotSource>, poll_interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (update_tx, update_rx) = mpsc::channel(UPDATE_BUFFER);
        let (state_tx, state) = watch::channel(DerivedState::new());

        let push = tokio::spawn(push_forwarder(
            Arc::clone(&hub),
            Arc::clone(&source),
            update_tx.clone(),
            shutdown_rx.clone(),
        ));
        let poll = tokio::spawn(poll_producer(hub, source, update_tx, poll_interval, shutdown_rx));
        let consume = tokio::spawn(consumer(update_rx, state_tx));

        Self {
            state,
            shutdown_tx,
            joins: vec![push, poll, consume],
        }
    }

    pub fn state(&self) -> watch::Receiver<DerivedState> {
        self.state.clone()
    }

    pub fn current(&self) -> DerivedState {
        self.state.borrow().clone()
    }

    pub fn request_shutdown(&self) {
        // ignore send error: producers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            let _ = j.await;
        }
    }
}

async fn resync(hub: &SyncHub, source: &dyn SnapshotSource, tx: &mpsc::Sender<Update>) -> bool {
    let seq = hub.last_seq();
    let snapshot = source.snapshot().await;
    tx.send(Update::Snapshot { snapshot, seq }).await.is_ok()
}

async fn push_forwarder(
    hub: Arc<SyncHub>,
    source: Arc<dyn SnapshotSource>,
    tx: mpsc::Sender<Update>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut events = hub.subscribe();
    if !resync(&hub, source.as_ref(), &tx).await {
        return;
    }
    info!("observer synced");

    loop {
        let received = tokio::select! {
            _ = shutdown_rx.wait_for(|stop| *stop) => break,
            received = events.recv() => received,
        };
        match received {
            Ok(event) => {
                if tx.send(Update::Event(event)).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "observer lagged behind push channel, resyncing");
                if !resync(&hub, source.as_ref(), &tx).await {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("push channel closed");
                break;
            }
        }
    }
}

async fn poll_producer(
    hub: Arc<SyncHub>,
    source: Arc<dyn SnapshotSource>,
    tx: mpsc::Sender<Update>,
    poll_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.wait_for(|stop| *stop) => break,
            _ = ticker.tick() => {}
        }
        let seq = hub.last_seq();
        let (blockers, at) = source.blockers().await;
        if tx.send(Update::BlockerPoll { blockers, at, seq }).await.is_err() {
            break;
        }
    }
}

/// Ends once both producers are gone.
async fn consumer(mut rx: mpsc::Receiver<Update>, state_tx: watch::Sender<DerivedState>) {
    while let Some(update) = rx.recv().await {
        state_tx.send_if_modified(|state| state.apply(update));
    }
    debug!("observer consumer stopped");
}
