//! Background task orchestration.
//!
//! Coordinates the complete task lifecycle:
//! - `Orchestrator`: task registry, per-key admission, completion detection,
//!   stale recovery, TTL pruning, batched parent notification
//! - `cleanup`: refcounted process-signal shutdown shared across instances

mod cleanup;
mod engine;
mod notify;

pub use engine::Orchestrator;
