//! Orchestration core for long-lived background agent tasks.
//!
//! Each task executes inside an external conversational session this crate
//! does not compute: it starts the session, watches it through an imperfect
//! polling oracle plus push events, and decides when it is done. The crate
//! owns admission control per resource key with FIFO queuing, the task state
//! machine, multi-signal completion detection, stale-task recovery, and
//! notification delivery that coalesces many finishing tasks into one
//! message per parent session.

pub mod concurrency;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod session;
pub mod task;

pub use concurrency::ConcurrencyController;
pub use config::{ConcurrencyConfig, WardenConfig};
pub use error::{Result, WardenError};
pub use orchestrator::Orchestrator;
pub use session::{
    tool_permissions, MessagePart, MessageRole, ModelRef, ParentNote, PromptRequest,
    SessionClient, SessionEvent, SessionMessage, SessionStatusKind, TodoItem, TodoStatus,
};
pub use task::{LaunchRequest, ResumeRequest, Task, TaskProgress, TaskStatus, TrackRequest};
