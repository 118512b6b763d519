//! Shared scripted session-client mock for integration tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use task_warden::{
    LaunchRequest, MessagePart, MessageRole, ParentNote, PromptRequest, Result, SessionClient,
    SessionMessage, SessionStatusKind, TodoItem, WardenConfig, WardenError,
};

#[derive(Default)]
pub struct MockClient {
    sessions_created: AtomicU64,
    pub statuses: Mutex<HashMap<String, SessionStatusKind>>,
    pub messages: Mutex<HashMap<String, Vec<SessionMessage>>>,
    pub todos: Mutex<HashMap<String, Vec<TodoItem>>>,
    pub prompts: Mutex<Vec<(String, PromptRequest)>>,
    pub notes: Mutex<Vec<(String, ParentNote)>>,
    /// When set, `start_prompt` rejects with this message.
    pub prompt_failure: Mutex<Option<String>>,
}

impl MockClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created_count(&self) -> u64 {
        self.sessions_created.load(Ordering::SeqCst)
    }

    /// Script a session as finished: coarse status idle plus one assistant
    /// message with real text output.
    pub fn finish_session(&self, session_id: &str, text: &str) {
        self.statuses
            .lock()
            .insert(session_id.to_string(), SessionStatusKind::Idle);
        self.messages.lock().insert(
            session_id.to_string(),
            vec![SessionMessage {
                role: MessageRole::Assistant,
                agent: None,
                model: None,
                parts: vec![MessagePart::Text {
                    text: text.to_string(),
                }],
            }],
        );
    }

    pub fn notes_snapshot(&self) -> Vec<(String, ParentNote)> {
        self.notes.lock().clone()
    }
}

#[async_trait]
impl SessionClient for MockClient {
    async fn create_session(
        &self,
        _parent_id: &str,
        _title: &str,
        _directory: &Path,
    ) -> Result<String> {
        let n = self.sessions_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("sess-{}", n))
    }

    async fn start_prompt(&self, session_id: &str, prompt: PromptRequest) -> Result<()> {
        if let Some(message) = self.prompt_failure.lock().clone() {
            return Err(WardenError::Prompt(message));
        }
        self.prompts.lock().push((session_id.to_string(), prompt));
        Ok(())
    }

    async fn session_status(&self) -> Result<HashMap<String, SessionStatusKind>> {
        Ok(self.statuses.lock().clone())
    }

    async fn messages(&self, session_id: &str) -> Result<Vec<SessionMessage>> {
        Ok(self
            .messages
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn todos(&self, session_id: &str) -> Result<Vec<TodoItem>> {
        Ok(self
            .todos
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn abort_session(&self, _session_id: &str) -> Result<()> {
        Ok(())
    }

    async fn notify_parent(&self, parent_id: &str, note: ParentNote) -> Result<()> {
        self.notes.lock().push((parent_id.to_string(), note));
        Ok(())
    }

    async fn parent_directory(&self, _parent_id: &str) -> Result<PathBuf> {
        Ok(PathBuf::from("/tmp/warden-tests"))
    }
}

/// Config tuned for deterministic tests: no minimum-elapsed guards and a
/// poll interval long enough that only explicit `poll_once` calls advance
/// detection.
pub fn test_config(limits: &[(&str, usize)]) -> WardenConfig {
    let mut config = WardenConfig {
        poll_interval_secs: 3600,
        min_idle_secs: 0,
        min_stability_secs: 0,
        ..WardenConfig::default()
    };
    for (key, limit) in limits {
        config.concurrency.limits.insert((*key).to_string(), *limit);
    }
    config
}

pub fn launch_request(agent: &str, parent: &str, description: &str) -> LaunchRequest {
    LaunchRequest {
        description: description.to_string(),
        prompt: format!("{}: go", description),
        agent: agent.to_string(),
        model: None,
        parent_session_id: parent.to_string(),
        parent_message_id: "msg-1".to_string(),
        parent_agent: Some("build".to_string()),
        parent_model: None,
        system: None,
    }
}

/// Opt-in tracing output for a test run, filtered by RUST_LOG.
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll a condition until it holds or two seconds elapse.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
