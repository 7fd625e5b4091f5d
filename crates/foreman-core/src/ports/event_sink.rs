//! EventSink port - ドメインイベントの出口
//!
//! # 実装
//! - NoopEventSink: 何もしない
//! - SyncHub (`crate::sync`): seq + タイムスタンプを付けて broadcast で observer へ push

use crate::domain::DomainEvent;

/// EventSink はドメインイベントを受け取る
///
/// 呼び出し側はロックを保持したまま emit することがあるので、実装はブロックしないこと。
pub trait EventSink: Send + Sync {
    fn emit(&self, event: DomainEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: DomainEvent) {}
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Collects events for assertions.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        events: Mutex<Vec<DomainEvent>>,
    }

    impl RecordingSink {
        pub(crate) fn kinds(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().iter().map(|e| e.kind()).collect()
        }

        pub(crate) fn events(&self) -> Vec<DomainEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: DomainEvent) {
            self.events.lock().unwrap().push(event);
        }
    }
}
