//! State sync: push channel (SyncHub), observer-side derived state, and the
//! observer that reconciles push and poll into it.

pub mod hub;
pub mod observer;
pub mod state;

pub use hub::SyncHub;
pub use observer::Observer;
pub use state::{DerivedState, Entry, ObservedBlocker, Stamp, TaskView, Update, WorkerView};
