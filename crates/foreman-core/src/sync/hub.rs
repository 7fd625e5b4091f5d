//! SyncHub - push 経路
//!
//! EventSink として DomainEvent を受け取り、単調増加の seq とサーバー時刻を付けて
//! broadcast で配ります。受信者がいなくても emit は失敗しません。
//!
//! seq の採番と send は同じ Mutex の中で行うので、broadcast 上の順序は seq 順になります。

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::trace;

use crate::domain::{DomainEvent, StampedEvent};
use crate::ports::{Clock, EventSink};

pub struct SyncHub {
    tx: broadcast::Sender<StampedEvent>,
    seq: Mutex<u64>,
    clock: Arc<dyn Clock>,
}

impl SyncHub {
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            seq: Mutex::new(0),
            clock,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StampedEvent> {
        self.tx.subscribe()
    }

    /// Sequence number of the most recently emitted event (0 before the first).
    ///
    /// Read it *before* taking a snapshot: events with a larger seq may not be
    /// reflected in that snapshot yet.
    pub fn last_seq(&self) -> u64 {
        *self.seq.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventSink for SyncHub {
    fn emit(&self, event: DomainEvent) {
        let mut seq = self.seq.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *seq += 1;
        let stamped = StampedEvent {
            seq: *seq,
            timestamp: self.clock.now(),
            event,
        };
        trace!(seq = stamped.seq, kind = stamped.event.kind(), "event");
        // no subscribers is fine
        let _ = self.tx.send(stamped);
    }
}
