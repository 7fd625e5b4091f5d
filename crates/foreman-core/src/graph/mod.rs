//! Dependency resolver: task records, DAG edges, readiness.

pub mod dependency;
pub mod plan;
pub mod store;

pub use dependency::DependencyGraph;
pub use plan::{Plan, PlanEntry};
pub use store::{StatusChange, TaskCounts, TaskGraph};
