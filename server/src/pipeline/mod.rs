//! The classification pipeline: poll the mailbox feed, enqueue new work,
//! classify pending items, persist the outcome, and emit events.

pub mod orchestrator;
pub mod scheduler;
pub mod source;

pub use orchestrator::Orchestrator;
pub use scheduler::CycleScheduler;
