#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};

use foreman_core::domain::BlockerType;
use foreman_core::impls::{Script, ScriptedQuestion, ScriptedWorkerFactory};
use foreman_core::ports::{FixedClock, SequentialIdGenerator};
use foreman_core::{App, AppBuilder, Coordinator, ForemanConfig};

pub struct World {
    pub app: App,
    pub factory: ScriptedWorkerFactory,
    pub clock: Arc<FixedClock>,
}

impl World {
    pub fn coordinator(&self) -> &Coordinator {
        self.app.coordinator()
    }
}

/// An app with deterministic ids, a hand-driven clock and scripted workers
/// for every role. Loops are not spawned; tests drive cycles themselves.
pub fn world(config: ForemanConfig, scripts: &[(&str, Script)]) -> World {
    let scripts: HashMap<String, Script> = scripts.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
    let factory = ScriptedWorkerFactory::new(scripts);
    let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
    let app = AppBuilder::new()
        .config(config)
        .clock(clock.clone())
        .ids(Arc::new(SequentialIdGenerator::new()))
        .register_all(Arc::new(factory.clone()))
        .unwrap()
        .build()
        .unwrap();
    World { app, factory, clock }
}

/// Run cycles until nothing new gets assigned and no execution is running.
pub async fn drive(coordinator: &Coordinator, max_cycles: usize) {
    for _ in 0..max_cycles {
        let report = coordinator.run_cycle().await;
        coordinator.wait_idle().await;
        if report.assigned.is_empty() && coordinator.in_flight() == 0 {
            break;
        }
    }
}

pub fn asks(blocker_type: BlockerType, question: &str) -> Script {
    Script {
        ask: Some(ScriptedQuestion {
            blocker_type,
            question: question.into(),
        }),
        ..Script::default()
    }
}
