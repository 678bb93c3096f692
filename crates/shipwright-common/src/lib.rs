//! Shared domain types for the Shipwright orchestration platform.
//!
//! This crate holds the types that cross the boundary between the daemon
//! binary and any future out-of-process collaborator (a worker pool, a
//! dashboard, a second host) — `Issue`, `Job`, pipeline stages, and the
//! stage failure-policy vocabulary. It carries no behavior beyond small
//! constructors and classification helpers; the orchestration logic that
//! consumes these types lives in the `shipwright` crate.

pub mod issue;
pub mod job;
pub mod stage;

pub use issue::Issue;
pub use job::{Job, JobStatus};
pub use stage::{FailurePolicy, IdempotencyClass, Stage, StageContract};
