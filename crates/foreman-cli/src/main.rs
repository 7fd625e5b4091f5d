//! foreman: run a plan with scripted workers and watch what the coordinator does.

mod cli;
mod logging;
mod plan;

use std::collections::BTreeMap;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{info, warn};

use foreman_core::blocker::ResolveOutcome;
use foreman_core::domain::{BlockerId, DomainEvent, GraphError, TaskId};
use foreman_core::graph::TaskGraph;
use foreman_core::impls::ScriptedWorkerFactory;
use foreman_core::ports::{Clock, SequentialIdGenerator, SystemClock};
use foreman_core::{AppBuilder, Coordinator, ForemanConfig};

use crate::cli::Command;
use crate::plan::PlanFile;

const SETTLE_CHECK: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> ExitCode {
    match run_main().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("foreman error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

async fn run_main() -> Result<ExitCode> {
    let args = cli::parse();
    logging::init_logging(args.log_level)?;
    match args.command {
        Command::Run {
            plan,
            config,
            auto_answer,
        } => run_plan(&plan, config.as_deref(), auto_answer).await,
        Command::Validate { plan } => validate_plan(&plan),
    }
}

// ========================================
// run
// ========================================

async fn run_plan(plan_path: &Path, config_path: Option<&Path>, auto_answer: Option<String>) -> Result<ExitCode> {
    let file = PlanFile::load(plan_path)?;
    let config = match config_path {
        Some(path) => ForemanConfig::from_json_file(path).with_context(|| format!("loading config {}", path.display()))?,
        None => ForemanConfig::default(),
    };

    let mut app = AppBuilder::new()
        .config(config)
        .register_all(Arc::new(ScriptedWorkerFactory::new(file.scripts())))?
        .expect_roles(&file.roles())
        .build()?;

    // subscribe before loading so no event is missed
    let mut events = app.hub().subscribe();
    let keys = app.coordinator().load_plan(&file.plan()).await.context("loading plan")?;
    info!(tasks = keys.len(), auto_answer = auto_answer.is_some(), "running plan");
    app.spawn();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut settle = tokio::time::interval(SETTLE_CHECK);
    settle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut interrupted = false;

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                warn!("interrupted");
                interrupted = true;
                break;
            }
            received = events.recv() => match received {
                Ok(stamped) => {
                    println!("{}", serde_json::to_string(&stamped)?);
                    if let (Some(answer), DomainEvent::BlockerCreated { blocker }) = (&auto_answer, &stamped.event) {
                        answer_blocker(app.coordinator(), blocker.id, answer).await;
                    }
                }
                Err(RecvError::Lagged(missed)) => warn!(missed, "event stream lagged; some events were not printed"),
                Err(RecvError::Closed) => break,
            },
            _ = settle.tick() => {
                if app.status().await.is_settled() {
                    break;
                }
            }
        }
    }

    // print what was already emitted before the loop noticed
    loop {
        match events.try_recv() {
            Ok(stamped) => println!("{}", serde_json::to_string(&stamped)?),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }

    let status = app.status().await;
    info!(
        completed = status.tasks.completed,
        failed = status.tasks.failed,
        blocked = status.tasks.blocked,
        pending_blockers = status.blockers.pending,
        "run finished"
    );
    app.shutdown().await;

    let clean = !interrupted && status.tasks.completed == status.tasks.total();
    Ok(if clean { ExitCode::SUCCESS } else { ExitCode::from(2) })
}

async fn answer_blocker(coordinator: &Coordinator, blocker_id: BlockerId, answer: &str) {
    match coordinator.resolve_blocker(blocker_id, answer).await {
        Ok(ResolveOutcome::Resolved(_)) => info!(%blocker_id, "blocker auto-answered"),
        Ok(ResolveOutcome::AlreadyResolved { status }) => info!(%blocker_id, %status, "blocker already closed"),
        Err(err) => warn!(%blocker_id, error = %err, "auto-answer failed"),
    }
}

// ========================================
// validate
// ========================================

fn validate_plan(plan_path: &Path) -> Result<ExitCode> {
    let file = PlanFile::load(plan_path)?;
    let (tasks, keys) = match file.plan().build(&SequentialIdGenerator::new(), SystemClock.now()) {
        Ok(built) => built,
        Err(err) => {
            eprintln!("invalid plan: {err}");
            return Ok(ExitCode::FAILURE);
        }
    };
    let names: BTreeMap<TaskId, String> = keys.iter().map(|(k, id)| (*id, k.clone())).collect();
    let name = |id: &TaskId| names.get(id).cloned().unwrap_or_else(|| id.to_string());

    let mut graph = TaskGraph::new();
    if let Err(err) = graph.add_tasks(tasks) {
        match err {
            GraphError::CycleDetected { cycle } => {
                let path: Vec<String> = cycle.iter().map(name).collect();
                eprintln!("invalid plan: dependency cycle {}", path.join(" -> "));
            }
            other => eprintln!("invalid plan: {other}"),
        }
        return Ok(ExitCode::FAILURE);
    }

    for (i, id) in graph.topological_order().iter().enumerate() {
        let Some(task) = graph.get(*id) else { continue };
        let depth = graph.dependency_depth(*id)?;
        let deps: Vec<String> = task.depends_on.iter().map(name).collect();
        if deps.is_empty() {
            println!("{:>3}. {} [{}] depth={}", i + 1, name(id), task.role, depth);
        } else {
            println!(
                "{:>3}. {} [{}] depth={} after {}",
                i + 1,
                name(id),
                task.role,
                depth,
                deps.join(", ")
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}
