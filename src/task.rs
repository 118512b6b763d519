//! Task records and their state machine.
//!
//! The public [`Task`] type is an immutable snapshot; live records are
//! [`TaskEntry`] values whose mutable state sits behind a mutex so that the
//! racing completion paths (push idle, poll idle, stability heuristic, stale
//! monitor, deletion) all resolve through compare-and-set transitions.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::ModelRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgress {
    pub tool_calls: u64,
    pub last_tool: Option<String>,
    pub last_update: DateTime<Utc>,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
}

impl TaskProgress {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            tool_calls: 0,
            last_tool: None,
            last_update: now,
            last_message: None,
            last_message_at: None,
        }
    }
}

/// Caller-visible snapshot of one background task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub description: String,
    pub prompt: String,
    pub agent: String,
    pub model: Option<ModelRef>,
    pub parent_session_id: String,
    pub parent_message_id: String,
    pub parent_agent: Option<String>,
    pub parent_model: Option<ModelRef>,
    pub session_id: Option<String>,
    pub concurrency_key: Option<String>,
    pub concurrency_group: Option<String>,
    pub progress: Option<TaskProgress>,
    pub error: Option<String>,
}

/// Launch specification supplied by the requesting session.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub description: String,
    pub prompt: String,
    pub agent: String,
    pub model: Option<ModelRef>,
    pub parent_session_id: String,
    pub parent_message_id: String,
    pub parent_agent: Option<String>,
    pub parent_model: Option<ModelRef>,
    /// Optional system preamble injected into the child session.
    pub system: Option<String>,
}

impl LaunchRequest {
    /// Resource bucket the launch is admitted under: the model reference
    /// when one is pinned, otherwise the agent name.
    pub fn concurrency_key(&self) -> String {
        match &self.model {
            Some(model) => model.to_string(),
            None => self.agent.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResumeRequest {
    pub session_id: String,
    pub prompt: String,
    pub parent_session_id: String,
    pub parent_message_id: String,
    pub parent_agent: Option<String>,
    pub parent_model: Option<ModelRef>,
}

/// Registration of a task created by a different entry point but tracked
/// here for notification purposes.
#[derive(Debug, Clone)]
pub struct TrackRequest {
    pub task_id: String,
    pub session_id: String,
    pub parent_session_id: String,
    pub description: String,
    pub agent: Option<String>,
    pub parent_agent: Option<String>,
    pub concurrency_key: Option<String>,
}

/// Result of a winning terminal transition: the concurrency slot taken from
/// the record, to be released exactly once by the caller.
#[derive(Debug)]
pub(crate) struct TaskFinish {
    pub released_key: Option<String>,
}

#[derive(Debug)]
pub(crate) struct TaskState {
    pub status: TaskStatus,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub description: String,
    pub prompt: String,
    pub agent: String,
    pub model: Option<ModelRef>,
    pub parent_session_id: String,
    pub parent_message_id: String,
    pub parent_agent: Option<String>,
    pub parent_model: Option<ModelRef>,
    pub session_id: Option<String>,
    pub concurrency_key: Option<String>,
    pub concurrency_group: Option<String>,
    pub progress: Option<TaskProgress>,
    pub last_msg_count: Option<usize>,
    pub stable_polls: u32,
    pub error: Option<String>,
}

/// Live task record. Shared between the registry, the admission queue, and
/// every detection path.
#[derive(Debug)]
pub(crate) struct TaskEntry {
    pub id: String,
    state: Mutex<TaskState>,
}

pub(crate) fn generate_task_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("bg_{}", &raw[..8])
}

/// Counters observed by one poll of a session's message list.
#[derive(Debug, Clone)]
pub(crate) struct PollObservation {
    pub message_count: usize,
    pub tool_calls: u64,
    pub last_tool: Option<String>,
    pub last_message: Option<String>,
}

impl TaskEntry {
    pub fn new_pending(request: &LaunchRequest) -> Arc<Self> {
        Arc::new(Self {
            id: generate_task_id(),
            state: Mutex::new(TaskState {
                status: TaskStatus::Pending,
                queued_at: Utc::now(),
                started_at: None,
                completed_at: None,
                description: request.description.clone(),
                prompt: request.prompt.clone(),
                agent: request.agent.clone(),
                model: request.model.clone(),
                parent_session_id: request.parent_session_id.clone(),
                parent_message_id: request.parent_message_id.clone(),
                parent_agent: request.parent_agent.clone(),
                parent_model: request.parent_model.clone(),
                session_id: None,
                concurrency_key: None,
                concurrency_group: None,
                progress: None,
                last_msg_count: None,
                stable_polls: 0,
                error: None,
            }),
        })
    }

    /// Record for an externally created session that is already running.
    pub fn new_external(
        request: &TrackRequest,
        group: String,
        held_key: Option<String>,
    ) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            id: request.task_id.clone(),
            state: Mutex::new(TaskState {
                status: TaskStatus::Running,
                queued_at: now,
                started_at: Some(now),
                completed_at: None,
                description: request.description.clone(),
                prompt: String::new(),
                agent: request
                    .agent
                    .clone()
                    .unwrap_or_else(|| "external".to_string()),
                model: None,
                parent_session_id: request.parent_session_id.clone(),
                parent_message_id: String::new(),
                parent_agent: request.parent_agent.clone(),
                parent_model: None,
                session_id: Some(request.session_id.clone()),
                concurrency_key: held_key,
                concurrency_group: Some(group),
                progress: Some(TaskProgress::new(now)),
                last_msg_count: None,
                stable_polls: 0,
                error: None,
            }),
        })
    }

    pub fn snapshot(&self) -> Task {
        let state = self.state.lock();
        Task {
            id: self.id.clone(),
            status: state.status,
            queued_at: state.queued_at,
            started_at: state.started_at,
            completed_at: state.completed_at,
            description: state.description.clone(),
            prompt: state.prompt.clone(),
            agent: state.agent.clone(),
            model: state.model.clone(),
            parent_session_id: state.parent_session_id.clone(),
            parent_message_id: state.parent_message_id.clone(),
            parent_agent: state.parent_agent.clone(),
            parent_model: state.parent_model.clone(),
            session_id: state.session_id.clone(),
            concurrency_key: state.concurrency_key.clone(),
            concurrency_group: state.concurrency_group.clone(),
            progress: state.progress.clone(),
            error: state.error.clone(),
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.state.lock().status
    }

    pub fn session_id(&self) -> Option<String> {
        self.state.lock().session_id.clone()
    }

    pub fn parent_session_id(&self) -> String {
        self.state.lock().parent_session_id.clone()
    }

    pub fn concurrency_group(&self) -> Option<String> {
        self.state.lock().concurrency_group.clone()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().started_at
    }

    /// Run a closure against the locked state. The CAS helpers below are the
    /// blessed transition paths; this exists for compound reads and for the
    /// few bookkeeping writes that do not change `status`.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut TaskState) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Pending -> Running. Fails if the task was cancelled while queued.
    pub fn begin_running(&self, session_id: String, key: String) -> bool {
        let mut state = self.state.lock();
        if state.status != TaskStatus::Pending {
            return false;
        }
        let now = Utc::now();
        state.status = TaskStatus::Running;
        state.started_at = Some(now);
        state.session_id = Some(session_id);
        state.concurrency_key = Some(key.clone());
        state.concurrency_group = Some(key);
        state.progress = Some(TaskProgress::new(now));
        state.last_msg_count = None;
        state.stable_polls = 0;
        true
    }

    /// Running -> terminal. Returns the slot to release if this call won the
    /// race; `None` means another path already finished the task.
    pub fn try_finish_running(
        &self,
        status: TaskStatus,
        error: Option<String>,
    ) -> Option<TaskFinish> {
        debug_assert!(status.is_terminal());
        let mut state = self.state.lock();
        if state.status != TaskStatus::Running {
            return None;
        }
        state.status = status;
        state.completed_at = Some(Utc::now());
        state.error = error;
        Some(TaskFinish {
            released_key: state.concurrency_key.take(),
        })
    }

    /// Any non-terminal state -> terminal. Used by TTL pruning and start
    /// failures, where the task may never have reached Running.
    pub fn force_finish(&self, status: TaskStatus, error: Option<String>) -> Option<TaskFinish> {
        debug_assert!(status.is_terminal());
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return None;
        }
        state.status = status;
        state.completed_at = Some(Utc::now());
        state.error = error;
        Some(TaskFinish {
            released_key: state.concurrency_key.take(),
        })
    }

    /// Terminal -> Running, re-entering under `key`. `started_at` is reset so
    /// the minimum-elapsed completion guards apply freshly to the resumed run.
    pub fn try_resume(&self, key: String, request: &ResumeRequest) -> bool {
        let mut state = self.state.lock();
        if !state.status.is_terminal() {
            return false;
        }
        let now = Utc::now();
        let carried_tool_calls = state.progress.as_ref().map_or(0, |p| p.tool_calls);
        state.status = TaskStatus::Running;
        state.completed_at = None;
        state.error = None;
        state.started_at = Some(now);
        state.parent_session_id = request.parent_session_id.clone();
        state.parent_message_id = request.parent_message_id.clone();
        state.parent_agent = request.parent_agent.clone();
        state.parent_model = request.parent_model.clone();
        state.concurrency_key = Some(key.clone());
        state.concurrency_group = Some(key);
        state.progress = Some(TaskProgress {
            tool_calls: carried_tool_calls,
            ..TaskProgress::new(now)
        });
        state.last_msg_count = None;
        state.stable_polls = 0;
        true
    }

    /// Take the held slot without a status transition. Shutdown path only.
    pub fn take_slot(&self) -> Option<String> {
        self.state.lock().concurrency_key.take()
    }

    /// Push-path progress: a tool part streamed into the session.
    pub fn record_tool_part(&self, tool: &str) {
        let mut state = self.state.lock();
        let now = Utc::now();
        let progress = state.progress.get_or_insert_with(|| TaskProgress::new(now));
        progress.tool_calls += 1;
        progress.last_tool = Some(tool.to_string());
        progress.last_update = now;
    }

    /// Poll-path progress: fold one observation of the message list into the
    /// record and return the consecutive-stable-poll count afterwards.
    /// `last_update` only moves when the observation shows actual advance, so
    /// the stale monitor keeps a usable signal.
    pub fn apply_poll_observation(&self, obs: PollObservation, min_stability: Duration) -> u32 {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.status != TaskStatus::Running {
            return 0;
        }
        let now = Utc::now();
        let started_at = state.started_at.unwrap_or(state.queued_at);

        let progress = state.progress.get_or_insert_with(|| TaskProgress::new(now));
        let advanced = progress.tool_calls != obs.tool_calls
            || state.last_msg_count != Some(obs.message_count);
        progress.tool_calls = obs.tool_calls;
        if obs.last_tool.is_some() {
            progress.last_tool = obs.last_tool;
        }
        if let Some(text) = obs.last_message {
            if progress.last_message.as_deref() != Some(text.as_str()) {
                progress.last_message_at = Some(now);
            }
            progress.last_message = Some(text);
        }
        if advanced {
            progress.last_update = now;
        }

        if now.signed_duration_since(started_at) >= min_stability {
            if state.last_msg_count == Some(obs.message_count) {
                state.stable_polls += 1;
            } else {
                state.stable_polls = 0;
            }
        }
        state.last_msg_count = Some(obs.message_count);
        state.stable_polls
    }

    /// How long the task has been in its current phase: queued time while
    /// pending, running time otherwise.
    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        let state = self.state.lock();
        let reference = match state.status {
            TaskStatus::Pending => Some(state.queued_at),
            _ => state.started_at,
        };
        reference.map(|t| now.signed_duration_since(t))
    }
}
