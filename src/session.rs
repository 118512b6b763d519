//! Boundary to the external session system.
//!
//! The orchestrator never computes a task's work itself; it drives sessions
//! owned by an external collaborator through [`SessionClient`]:
//! - `create_session` / `start_prompt`: launch work
//! - `session_status` / `messages` / `todos`: observe it
//! - `abort_session`: best-effort teardown
//! - `notify_parent`: report back to the requesting session

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Provider-qualified model reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider_id: String,
    pub model_id: String,
}

impl ModelRef {
    pub fn new(provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
        }
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider_id, self.model_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
    System,
}

/// One part of a session message, mirroring the external wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    Reasoning { text: String },
    Tool { tool: String },
    ToolResult { content: String },
    StepStart,
    StepFinish,
}

impl MessagePart {
    /// Whether this part is evidence of genuine agent output. Metadata-only
    /// parts (step markers, blank text) do not count.
    pub fn carries_output(&self) -> bool {
        match self {
            Self::Text { text } | Self::Reasoning { text } => !text.trim().is_empty(),
            Self::Tool { .. } => true,
            Self::ToolResult { content } => !content.trim().is_empty(),
            Self::StepStart | Self::StepFinish => false,
        }
    }

    pub fn tool_name(&self) -> Option<&str> {
        match self {
            Self::Tool { tool } => Some(tool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: MessageRole,
    /// Agent identity carried on the message, when the external system
    /// records one.
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub model: Option<ModelRef>,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

impl SessionMessage {
    pub fn is_agent_output(&self) -> bool {
        matches!(self.role, MessageRole::Assistant | MessageRole::Tool)
    }

    pub fn has_output_content(&self) -> bool {
        self.is_agent_output() && self.parts.iter().any(MessagePart::carries_output)
    }
}

/// Coarse per-session status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatusKind {
    Idle,
    Busy,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl TodoStatus {
    pub fn is_open(self) -> bool {
        !matches!(self, Self::Completed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub content: String,
    pub status: TodoStatus,
}

/// Prompt issued into a freshly created or resumed session.
#[derive(Debug, Clone)]
pub struct PromptRequest {
    pub agent: String,
    pub model: Option<ModelRef>,
    pub system: Option<String>,
    pub tools: BTreeMap<String, bool>,
    pub text: String,
}

/// Message delivered back into a parent session.
#[derive(Debug, Clone)]
pub struct ParentNote {
    pub agent: Option<String>,
    pub model: Option<ModelRef>,
    pub text: String,
    /// When set, the parent should receive the note without being prompted
    /// to reply.
    pub suppress_reply: bool,
}

/// Push events the external system feeds into the orchestrator.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PartUpdated {
        session_id: String,
        part: MessagePart,
    },
    Idle {
        session_id: String,
    },
    Deleted {
        session_id: String,
    },
}

/// Tool permissions for a launched agent session.
///
/// Delegation tools are always denied so a background agent cannot fan out
/// further; exploration-type agents additionally lose write access.
pub fn tool_permissions(agent: &str) -> BTreeMap<String, bool> {
    let mut tools = BTreeMap::new();

    match agent {
        "explore" | "librarian" => {
            tools.insert("write".to_string(), false);
            tools.insert("edit".to_string(), false);
        }
        "oracle" => {
            tools.insert("write".to_string(), false);
            tools.insert("edit".to_string(), false);
        }
        _ => {}
    }

    tools.insert("task".to_string(), false);
    tools.insert("delegate_task".to_string(), false);
    tools.insert("call_omo_agent".to_string(), true);
    tools
}

/// The external execution collaborator.
///
/// Every method may fail; callers inside the orchestrator convert failures
/// into task transitions or logged warnings rather than letting them
/// propagate out of monitoring loops.
#[async_trait]
pub trait SessionClient: Send + Sync {
    /// Create a new session under `parent_id`, returning its id.
    async fn create_session(
        &self,
        parent_id: &str,
        title: &str,
        directory: &Path,
    ) -> Result<String>;

    /// Start or resume the agent loop in `session_id`. The orchestrator
    /// issues this fire-and-forget; a rejection is fed back through the
    /// task's error path.
    async fn start_prompt(&self, session_id: &str, prompt: PromptRequest) -> Result<()>;

    /// Coarse status for every live session.
    async fn session_status(&self) -> Result<HashMap<String, SessionStatusKind>>;

    /// Full ordered message list for one session.
    async fn messages(&self, session_id: &str) -> Result<Vec<SessionMessage>>;

    /// Work-item list for one session. Failures are treated by callers as
    /// "nothing incomplete".
    async fn todos(&self, session_id: &str) -> Result<Vec<TodoItem>>;

    /// Best-effort abort of the underlying session.
    async fn abort_session(&self, session_id: &str) -> Result<()>;

    /// Deliver a note into the parent session.
    async fn notify_parent(&self, parent_id: &str, note: ParentNote) -> Result<()>;

    /// Working directory of the parent session, for inheriting into child
    /// sessions.
    async fn parent_directory(&self, parent_id: &str) -> Result<PathBuf>;
}
