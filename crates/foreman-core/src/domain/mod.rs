//! Domain model (IDs, tasks, blockers, slots, outcomes, decisions, events, errors).
//!
//! Pure data and pure rules only: nothing in here locks, spawns or sleeps.

pub mod blocker;
pub mod decision;
pub mod errors;
pub mod events;
pub mod ids;
pub mod outcome;
pub mod role;
pub mod slot;
pub mod task;

pub use blocker::{Blocker, BlockerStatus, BlockerType};
pub use decision::{Decider, Decision, DecisionRecord, DefaultDecider, RetryPolicy};
pub use errors::{BlockerError, ConfigError, ForemanError, GraphError, PoolError};
pub use events::{DomainEvent, StampedEvent};
pub use ids::{BlockerId, ProjectId, TaskId, WorkerId};
pub use outcome::{BlockerRequest, Outcome, OutcomeKind};
pub use role::Role;
pub use slot::{SlotState, WorkerSlot};
pub use task::{FailureReason, Task, TaskStatus};
