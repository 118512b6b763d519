use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cleanup;
use super::notify::{compose_all_complete, compose_remaining, NotificationLedger};
use crate::concurrency::ConcurrencyController;
use crate::config::WardenConfig;
use crate::error::{Result, WardenError};
use crate::session::{
    tool_permissions, MessagePart, MessageRole, ModelRef, ParentNote, PromptRequest,
    SessionClient, SessionEvent, SessionStatusKind,
};
use crate::task::{
    LaunchRequest, PollObservation, ResumeRequest, Task, TaskEntry, TaskStatus, TrackRequest,
};

struct QueueItem {
    entry: Arc<TaskEntry>,
    request: LaunchRequest,
}

#[derive(Default)]
struct AdmissionQueues {
    by_key: HashMap<String, VecDeque<QueueItem>>,
    /// Keys with a live drain loop. Guarded by the same lock as the queues
    /// so an enqueue can never race past a terminating drain unnoticed.
    draining: HashSet<String>,
}

/// Orchestration core for background agent tasks.
///
/// Owns the canonical task registry, per-key admission, the completion
/// detector, the stale monitor, and parent notification. All state is
/// in-memory for the process lifetime; construct once and share via `Arc`.
pub struct Orchestrator {
    client: Arc<dyn SessionClient>,
    config: WardenConfig,
    directory: PathBuf,
    tasks: DashMap<String, Arc<TaskEntry>>,
    controller: ConcurrencyController,
    queues: Mutex<AdmissionQueues>,
    ledger: NotificationLedger,
    poller: Mutex<Option<JoinHandle<()>>>,
    shutdown_done: AtomicBool,
    cleanup_id: AtomicU64,
    /// Self-handle for detached work (drain loops, poll loop, evictions).
    /// Always upgradable while the owning `Arc` lives.
    self_ref: Weak<Self>,
}

impl Orchestrator {
    /// Build an orchestrator and register it for process-signal cleanup.
    /// Must be called from within a Tokio runtime.
    pub fn new(
        client: Arc<dyn SessionClient>,
        config: WardenConfig,
        directory: impl Into<PathBuf>,
    ) -> Arc<Self> {
        let directory = directory.into();
        let orchestrator = Arc::new_cyclic(|weak| Self {
            controller: ConcurrencyController::new(config.concurrency.clone()),
            client,
            config,
            directory,
            tasks: DashMap::new(),
            queues: Mutex::new(AdmissionQueues::default()),
            ledger: NotificationLedger::new(),
            poller: Mutex::new(None),
            shutdown_done: AtomicBool::new(false),
            cleanup_id: AtomicU64::new(0),
            self_ref: weak.clone(),
        });
        let id = cleanup::register(&orchestrator);
        orchestrator.cleanup_id.store(id, Ordering::SeqCst);
        orchestrator
    }

    fn shared(&self) -> Option<Arc<Self>> {
        self.self_ref.upgrade()
    }

    /// Queue a new task. The task is admitted under its concurrency key and
    /// started by the key's drain loop; the returned snapshot is `pending`.
    pub fn launch(&self, request: LaunchRequest) -> Result<Task> {
        if self.shutdown_done.load(Ordering::SeqCst) {
            return Err(WardenError::Shutdown);
        }
        if request.agent.trim().is_empty() {
            return Err(WardenError::AgentRequired);
        }

        let entry = TaskEntry::new_pending(&request);
        info!(
            task_id = %entry.id,
            agent = %request.agent,
            parent = %request.parent_session_id,
            "launch requested"
        );
        self.tasks.insert(entry.id.clone(), Arc::clone(&entry));
        self.ledger
            .track_pending(&request.parent_session_id, &entry.id);

        let key = request.concurrency_key();
        let snapshot = entry.snapshot();
        self.enqueue(key, QueueItem { entry, request });
        Ok(snapshot)
    }

    fn enqueue(&self, key: String, item: QueueItem) {
        let mut queues = self.queues.lock();
        let queue = queues.by_key.entry(key.clone()).or_default();
        queue.push_back(item);
        debug!(key = %key, depth = queue.len(), "task queued");

        if queues.draining.insert(key.clone()) {
            match self.shared() {
                Some(this) => {
                    tokio::spawn(async move { this.drain_key(key).await });
                }
                None => {
                    queues.draining.remove(&key);
                }
            }
        }
    }

    /// Single drain loop per key: pull the head, admit it, start it. Tasks
    /// cancelled (or pruned) while queued are dropped without consuming
    /// capacity.
    async fn drain_key(self: Arc<Self>, key: String) {
        loop {
            let item = {
                let mut queues = self.queues.lock();
                match queues.by_key.get_mut(&key).and_then(VecDeque::pop_front) {
                    Some(item) => item,
                    None => {
                        queues.by_key.remove(&key);
                        queues.draining.remove(&key);
                        return;
                    }
                }
            };

            if item.entry.status() != TaskStatus::Pending {
                debug!(task_id = %item.entry.id, "dropping settled task from queue");
                continue;
            }

            if let Err(error) = self.controller.acquire(&key).await {
                debug!(key = %key, error = %error, "admission aborted");
                self.queues.lock().draining.remove(&key);
                return;
            }

            if item.entry.status() != TaskStatus::Pending {
                // Cancelled while waiting for the slot.
                self.controller.release(&key);
                continue;
            }

            if let Err(error) = self.start_task(&item, &key).await {
                warn!(task_id = %item.entry.id, error = %error, "failed to start task");
            }
        }
    }

    async fn start_task(&self, item: &QueueItem, key: &str) -> Result<()> {
        let entry = &item.entry;
        let request = &item.request;

        let directory = match self
            .client
            .parent_directory(&request.parent_session_id)
            .await
        {
            Ok(dir) => dir,
            Err(error) => {
                debug!(
                    task_id = %entry.id,
                    error = %error,
                    "parent directory lookup failed, using default"
                );
                self.directory.clone()
            }
        };

        let title = format!("Background: {}", request.description);
        let session_id = match self
            .client
            .create_session(&request.parent_session_id, &title, &directory)
            .await
        {
            Ok(id) => id,
            Err(error) => {
                self.controller.release(key);
                self.fail_task(entry, format!("Failed to create background session: {}", error))
                    .await;
                return Err(WardenError::SessionCreate(error.to_string()));
            }
        };

        if !entry.begin_running(session_id.clone(), key.to_string()) {
            // Cancelled during session creation; the fresh session is orphaned.
            self.controller.release(key);
            let client = Arc::clone(&self.client);
            tokio::spawn(async move {
                let _ = client.abort_session(&session_id).await;
            });
            return Ok(());
        }

        self.start_polling();
        info!(
            task_id = %entry.id,
            session_id = %session_id,
            agent = %request.agent,
            "task started"
        );

        let prompt = PromptRequest {
            agent: request.agent.clone(),
            model: request.model.clone(),
            system: request.system.clone(),
            tools: tool_permissions(&request.agent),
            text: request.prompt.clone(),
        };
        self.spawn_prompt(entry, session_id, prompt);
        Ok(())
    }

    /// Issue the start/resume prompt fire-and-forget. A rejection feeds the
    /// same failure transition the synchronous error paths use.
    fn spawn_prompt(&self, entry: &Arc<TaskEntry>, session_id: String, prompt: PromptRequest) {
        let Some(this) = self.shared() else {
            return;
        };
        let entry = Arc::clone(entry);
        let agent = prompt.agent.clone();
        tokio::spawn(async move {
            if let Err(error) = this.client.start_prompt(&session_id, prompt).await {
                warn!(task_id = %entry.id, error = %error, "prompt rejected");
                let text = error.to_string();
                let message = if text.contains("unknown agent") || text.contains("agent not found")
                {
                    format!(
                        "Agent \"{}\" not found. Make sure the agent is registered with the session system.",
                        agent
                    )
                } else {
                    text
                };
                this.fail_task(&entry, message).await;
            }
        });
    }

    /// Shared failure transition: any non-terminal state becomes `Error`,
    /// the slot is released, and the parent is notified.
    async fn fail_task(&self, entry: &Arc<TaskEntry>, message: String) {
        let Some(finish) = entry.force_finish(TaskStatus::Error, Some(message)) else {
            return;
        };
        if let Some(key) = finish.released_key {
            self.controller.release(&key);
        }
        self.settle_and_notify(entry).await;
    }

    /// Resume a settled task in its existing session, re-admitted under its
    /// durable concurrency group.
    pub async fn resume(&self, request: ResumeRequest) -> Result<Task> {
        let entry = self
            .find_entry_by_session(&request.session_id)
            .ok_or_else(|| WardenError::TaskNotFound(request.session_id.clone()))?;

        if entry.status() == TaskStatus::Running {
            debug!(task_id = %entry.id, "resume skipped, task already running");
            return Ok(entry.snapshot());
        }

        let key = entry
            .concurrency_group()
            .unwrap_or_else(|| entry.snapshot().agent);
        self.controller.acquire(&key).await?;

        if !entry.try_resume(key.clone(), &request) {
            // Another resume won while this one waited for the slot.
            self.controller.release(&key);
            return Ok(entry.snapshot());
        }

        self.ledger
            .track_pending(&request.parent_session_id, &entry.id);
        self.start_polling();
        info!(task_id = %entry.id, session_id = %request.session_id, "resuming task");

        let snapshot = entry.snapshot();
        let prompt = PromptRequest {
            agent: snapshot.agent.clone(),
            model: snapshot.model.clone(),
            system: None,
            tools: tool_permissions(&snapshot.agent),
            text: request.prompt.clone(),
        };
        self.spawn_prompt(&entry, request.session_id.clone(), prompt);
        Ok(entry.snapshot())
    }

    /// Track a task whose session was created by a different entry point so
    /// it participates in notification batching and monitoring here.
    pub async fn track_external(&self, request: TrackRequest) -> Result<Task> {
        if let Some(entry) = self
            .tasks
            .get(&request.task_id)
            .map(|r| Arc::clone(r.value()))
        {
            let (parent_changed, old_parent, status) = entry.with_state(|state| {
                let changed = state.parent_session_id != request.parent_session_id;
                let old = state.parent_session_id.clone();
                if changed {
                    state.parent_session_id = request.parent_session_id.clone();
                }
                if let Some(agent) = &request.parent_agent {
                    state.parent_agent = Some(agent.clone());
                }
                if state.concurrency_group.is_none() {
                    state.concurrency_group = Some(
                        request
                            .concurrency_key
                            .clone()
                            .unwrap_or_else(|| state.agent.clone()),
                    );
                }
                (changed, old, state.status)
            });

            // Clean the old parent's pending set before rebinding.
            if parent_changed {
                self.ledger.forget_pending(&old_parent, &entry.id);
            }
            self.start_polling();

            if matches!(status, TaskStatus::Pending | TaskStatus::Running) {
                self.ledger
                    .track_pending(&request.parent_session_id, &entry.id);
            } else if !parent_changed {
                self.ledger
                    .forget_pending(&request.parent_session_id, &entry.id);
            }

            debug!(task_id = %entry.id, "external task already registered");
            return Ok(entry.snapshot());
        }

        let group = request
            .concurrency_key
            .clone()
            .or_else(|| request.agent.clone())
            .unwrap_or_else(|| "external".to_string());

        if let Some(key) = &request.concurrency_key {
            self.controller.acquire(key).await?;
        }

        let entry = TaskEntry::new_external(&request, group, request.concurrency_key.clone());
        self.tasks.insert(entry.id.clone(), Arc::clone(&entry));
        self.ledger
            .track_pending(&request.parent_session_id, &entry.id);
        self.start_polling();
        info!(task_id = %entry.id, session_id = %request.session_id, "registered external task");
        Ok(entry.snapshot())
    }

    /// Cancel a task that is still queued. No session exists and no slot was
    /// acquired, so this only removes it from its queue and settles the
    /// bookkeeping. Returns false once the task has started.
    pub fn cancel_pending(&self, task_id: &str) -> bool {
        let Some(entry) = self.tasks.get(task_id).map(|r| Arc::clone(r.value())) else {
            return false;
        };

        let snapshot = entry.snapshot();
        if snapshot.status != TaskStatus::Pending {
            return false;
        }

        let key = snapshot
            .model
            .as_ref()
            .map(ModelRef::to_string)
            .unwrap_or_else(|| snapshot.agent.clone());
        {
            let mut queues = self.queues.lock();
            if let Some(queue) = queues.by_key.get_mut(&key) {
                queue.retain(|item| item.entry.id != task_id);
                if queue.is_empty() {
                    queues.by_key.remove(&key);
                }
            }
        }

        let cancelled = entry.with_state(|state| {
            if state.status != TaskStatus::Pending {
                return false;
            }
            state.status = TaskStatus::Cancelled;
            state.completed_at = Some(Utc::now());
            true
        });
        if !cancelled {
            return false;
        }

        self.ledger
            .forget_pending(&snapshot.parent_session_id, task_id);
        info!(task_id, key = %key, "cancelled pending task");
        true
    }

    /// Ingest a push event from the external system.
    pub async fn handle_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::PartUpdated { session_id, part } => {
                let Some(entry) = self.find_entry_by_session(&session_id) else {
                    return;
                };
                if let Some(tool) = part.tool_name() {
                    entry.record_tool_part(tool);
                }
            }
            SessionEvent::Idle { session_id } => {
                let Some(entry) = self.find_entry_by_session(&session_id) else {
                    return;
                };
                if entry.status() != TaskStatus::Running {
                    return;
                }
                if !self.min_idle_elapsed(&entry) {
                    debug!(task_id = %entry.id, "ignoring early idle signal");
                    return;
                }
                self.check_candidate(&entry, &session_id, "idle event").await;
            }
            SessionEvent::Deleted { session_id } => {
                let Some(entry) = self.find_entry_by_session(&session_id) else {
                    return;
                };
                if let Some(finish) = entry
                    .try_finish_running(TaskStatus::Cancelled, Some("Session deleted".to_string()))
                {
                    if let Some(key) = finish.released_key {
                        self.controller.release(&key);
                    }
                }
                if let Some(key) = entry.take_slot() {
                    self.controller.release(&key);
                }
                let parent = entry.parent_session_id();
                self.ledger.forget_pending(&parent, &entry.id);
                self.tasks.remove(&entry.id);
                self.ledger.drop_delivered_task(&entry.id);
                info!(task_id = %entry.id, "task removed after external session deletion");
            }
        }
    }

    fn min_idle_elapsed(&self, entry: &TaskEntry) -> bool {
        let Some(started_at) = entry.started_at() else {
            return false;
        };
        Utc::now().signed_duration_since(started_at)
            >= Duration::seconds(self.config.min_idle_secs as i64)
    }

    /// Three-condition completion gate, re-verifying the task status after
    /// every asynchronous step; the racing paths may settle it meanwhile.
    async fn check_candidate(&self, entry: &Arc<TaskEntry>, session_id: &str, source: &str) {
        if !self.session_has_output(session_id).await {
            debug!(task_id = %entry.id, source, "candidate without output, waiting");
            return;
        }
        if entry.status() != TaskStatus::Running {
            return;
        }
        if self.has_incomplete_todos(session_id).await {
            debug!(task_id = %entry.id, source, "incomplete todos, waiting");
            return;
        }
        if entry.status() != TaskStatus::Running {
            return;
        }
        self.try_complete(entry, source).await;
    }

    /// Idempotent completion: exactly one caller wins the transition,
    /// releases the slot, and notifies. The slot is released before any
    /// further awaits so a notification failure cannot leak capacity.
    async fn try_complete(&self, entry: &Arc<TaskEntry>, source: &str) -> bool {
        let Some(finish) = entry.try_finish_running(TaskStatus::Completed, None) else {
            debug!(task_id = %entry.id, source, "task already settled, skipping");
            return false;
        };
        if let Some(key) = finish.released_key {
            self.controller.release(&key);
        }
        info!(task_id = %entry.id, source, "task completed");
        self.settle_and_notify(entry).await;
        true
    }

    async fn settle_and_notify(&self, entry: &Arc<TaskEntry>) {
        let task = entry.snapshot();
        self.ledger.record_delivered(task.clone());
        self.notify_parent_session(&task).await;
    }

    /// Deliver the settlement note for `task`, batched per parent: the last
    /// outstanding task produces one full summary, earlier ones an
    /// individual note with replies suppressed. Failures are logged only.
    async fn notify_parent_session(&self, task: &Task) {
        let parent_id = task.parent_session_id.clone();
        let remaining = self.ledger.settle(&parent_id, &task.id);
        let all_complete = remaining == 0;

        let text = if all_complete {
            let settled: Vec<Task> = self
                .tasks
                .iter()
                .map(|r| r.value().snapshot())
                .filter(|t| {
                    t.parent_session_id == parent_id
                        && !matches!(t.status, TaskStatus::Running | TaskStatus::Pending)
                })
                .collect();
            compose_all_complete(task, &settled)
        } else {
            compose_remaining(task, remaining)
        };

        if parent_id.is_empty() {
            self.schedule_eviction(task.id.clone());
            return;
        }

        let (agent, model) = self.resolve_parent_identity(task, &parent_id).await;
        let note = ParentNote {
            agent,
            model,
            text,
            suppress_reply: !all_complete,
        };
        match self.client.notify_parent(&parent_id, note).await {
            Ok(()) => debug!(task_id = %task.id, all_complete, "parent notified"),
            Err(error) => {
                warn!(task_id = %task.id, error = %error, "failed to notify parent")
            }
        }

        self.schedule_eviction(task.id.clone());
    }

    /// Address the parent with the identity of its most recent message that
    /// carries agent/model metadata, falling back to what the task recorded.
    async fn resolve_parent_identity(
        &self,
        task: &Task,
        parent_id: &str,
    ) -> (Option<String>, Option<ModelRef>) {
        match self.client.messages(parent_id).await {
            Ok(messages) => {
                for message in messages.iter().rev() {
                    if message.agent.is_some() || message.model.is_some() {
                        return (
                            message.agent.clone().or_else(|| task.parent_agent.clone()),
                            message.model.clone(),
                        );
                    }
                }
                (task.parent_agent.clone(), task.parent_model.clone())
            }
            Err(error) => {
                debug!(
                    error = %error,
                    "parent identity lookup failed, using recorded parent"
                );
                (task.parent_agent.clone(), task.parent_model.clone())
            }
        }
    }

    /// Keep the settled task retrievable for the retention window, then
    /// evict it unless something else removed it first.
    fn schedule_eviction(&self, task_id: String) {
        let retention = self.config.retention();
        let Some(this) = self.shared() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            if this.tasks.remove(&task_id).is_some() {
                this.ledger.drop_delivered_task(&task_id);
                debug!(task_id = %task_id, "evicted settled task");
            }
        });
    }

    fn start_polling(&self) {
        let mut poller = self.poller.lock();
        if poller.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let Some(this) = self.shared() else {
            return;
        };
        *poller = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.poll_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if this.shutdown_done.load(Ordering::SeqCst) {
                    break;
                }
                this.poll_once().await;
                if !this.has_running_tasks() {
                    break;
                }
            }
            debug!("poll loop stopped");
        }));
    }

    /// Run one monitoring cycle immediately: prune expired tasks, cancel
    /// stale ones, then evaluate every running task for completion. The
    /// background loop does this on an interval; hosts that drive their own
    /// cadence can call it directly.
    pub async fn poll_once(&self) {
        self.prune_expired();
        self.check_stale_tasks().await;

        let statuses = match self.client.session_status().await {
            Ok(map) => map,
            Err(error) => {
                warn!(error = %error, "session status poll failed");
                HashMap::new()
            }
        };

        for entry in self.running_entries() {
            let Some(session_id) = entry.session_id() else {
                continue;
            };
            let coarse = statuses.get(&session_id).copied();
            self.poll_task(&entry, &session_id, coarse).await;
        }
    }

    async fn poll_task(
        &self,
        entry: &Arc<TaskEntry>,
        session_id: &str,
        coarse: Option<SessionStatusKind>,
    ) {
        if coarse == Some(SessionStatusKind::Idle) {
            if self.min_idle_elapsed(entry) {
                self.check_candidate(entry, session_id, "poll idle").await;
            }
            return;
        }

        // Coarse status inconclusive: recompute progress from the message
        // list and apply the stability heuristic.
        let messages = match self.client.messages(session_id).await {
            Ok(messages) => messages,
            Err(error) => {
                debug!(task_id = %entry.id, error = %error, "message poll failed");
                return;
            }
        };

        let mut tool_calls = 0u64;
        let mut last_tool = None;
        let mut last_message = None;
        for message in &messages {
            if message.role != MessageRole::Assistant {
                continue;
            }
            for part in &message.parts {
                match part {
                    MessagePart::Tool { tool } => {
                        tool_calls += 1;
                        last_tool = Some(tool.clone());
                    }
                    MessagePart::Text { text } if !text.is_empty() => {
                        last_message = Some(text.clone());
                    }
                    _ => {}
                }
            }
        }

        let stable_polls = entry.apply_poll_observation(
            PollObservation {
                message_count: messages.len(),
                tool_calls,
                last_tool,
                last_message,
            },
            Duration::seconds(self.config.min_stability_secs as i64),
        );

        if stable_polls >= self.config.stable_polls_required {
            self.check_candidate(entry, session_id, "stability detection")
                .await;
        }
    }

    /// Force-cancel running tasks whose progress stopped advancing. Runs
    /// before completion checks each cycle.
    async fn check_stale_tasks(&self) {
        let stale_timeout = Duration::seconds(self.config.stale_timeout_secs as i64);
        let min_runtime = Duration::seconds(self.config.min_runtime_before_stale_secs as i64);
        let now = Utc::now();

        for entry in self.running_entries() {
            let Some((started_at, last_update)) = entry.with_state(|state| {
                if state.status != TaskStatus::Running {
                    return None;
                }
                let started = state.started_at?;
                let last = state.progress.as_ref()?.last_update;
                Some((started, last))
            }) else {
                continue;
            };

            if now.signed_duration_since(started_at) < min_runtime {
                continue;
            }
            let since_update = now.signed_duration_since(last_update);
            if since_update <= stale_timeout {
                continue;
            }

            let stale_minutes =
                ((since_update.num_seconds() as f64) / 60.0).round() as i64;
            let message = format!("stale timeout (no activity for {}min)", stale_minutes);
            let Some(finish) = entry.try_finish_running(TaskStatus::Cancelled, Some(message))
            else {
                continue;
            };
            if let Some(key) = finish.released_key {
                self.controller.release(&key);
            }

            if let Some(session_id) = entry.session_id() {
                let client = Arc::clone(&self.client);
                tokio::spawn(async move {
                    let _ = client.abort_session(&session_id).await;
                });
            }
            warn!(task_id = %entry.id, "task interrupted: stale timeout");
            self.settle_and_notify(&entry).await;
        }
    }

    /// Drop tasks that exceeded the hard TTL, whatever their state, along
    /// with their queue and ledger entries. Pruned tasks are not announced.
    fn prune_expired(&self) {
        let ttl = Duration::seconds(self.config.task_ttl_secs as i64);
        let now = Utc::now();
        let ttl_minutes = self.config.task_ttl_secs / 60;

        let mut expired = Vec::new();
        for r in self.tasks.iter() {
            if let Some(age) = r.value().age(now) {
                if age > ttl {
                    expired.push(Arc::clone(r.value()));
                }
            }
        }

        for entry in expired {
            let status = entry.status();
            let message = if status == TaskStatus::Pending {
                format!("Task timed out while queued ({} minutes)", ttl_minutes)
            } else {
                format!("Task timed out after {} minutes", ttl_minutes)
            };
            // Already-terminal tasks keep their status; the cleanup below
            // still applies to them.
            if let Some(finish) = entry.force_finish(TaskStatus::Error, Some(message)) {
                if let Some(key) = finish.released_key {
                    self.controller.release(&key);
                }
            }

            {
                let mut queues = self.queues.lock();
                for queue in queues.by_key.values_mut() {
                    queue.retain(|item| item.entry.id != entry.id);
                }
                queues.by_key.retain(|_, queue| !queue.is_empty());
            }

            warn!(task_id = %entry.id, status = %status, "pruning expired task");
            let parent = entry.parent_session_id();
            self.ledger.forget_pending(&parent, &entry.id);
            self.ledger.drop_delivered_task(&entry.id);
            self.tasks.remove(&entry.id);
        }

        self.ledger.prune_expired(ttl, now);
    }

    fn running_entries(&self) -> Vec<Arc<TaskEntry>> {
        self.tasks
            .iter()
            .filter(|r| r.value().status() == TaskStatus::Running)
            .map(|r| Arc::clone(r.value()))
            .collect()
    }

    fn has_running_tasks(&self) -> bool {
        self.tasks
            .iter()
            .any(|r| r.value().status() == TaskStatus::Running)
    }

    fn find_entry_by_session(&self, session_id: &str) -> Option<Arc<TaskEntry>> {
        self.tasks
            .iter()
            .find(|r| r.value().session_id().as_deref() == Some(session_id))
            .map(|r| Arc::clone(r.value()))
    }

    pub fn task(&self, id: &str) -> Option<Task> {
        self.tasks.get(id).map(|r| r.value().snapshot())
    }

    pub fn find_by_session(&self, session_id: &str) -> Option<Task> {
        self.find_entry_by_session(session_id)
            .map(|entry| entry.snapshot())
    }

    pub fn tasks_by_parent(&self, parent_id: &str) -> Vec<Task> {
        self.tasks
            .iter()
            .map(|r| r.value().snapshot())
            .filter(|task| task.parent_session_id == parent_id)
            .collect()
    }

    /// Direct and transitive children of a session, walked through each
    /// child's own session id.
    pub fn all_descendant_tasks(&self, session_id: &str) -> Vec<Task> {
        let mut result = Vec::new();
        for child in self.tasks_by_parent(session_id) {
            let child_session = child.session_id.clone();
            result.push(child);
            if let Some(sid) = child_session {
                result.extend(self.all_descendant_tasks(&sid));
            }
        }
        result
    }

    pub fn running_tasks(&self) -> Vec<Task> {
        self.tasks
            .iter()
            .map(|r| r.value().snapshot())
            .filter(|task| task.status == TaskStatus::Running)
            .collect()
    }

    /// Tasks that are no longer running but still retained in the registry.
    pub fn settled_tasks(&self) -> Vec<Task> {
        self.tasks
            .iter()
            .map(|r| r.value().snapshot())
            .filter(|task| task.status != TaskStatus::Running)
            .collect()
    }

    /// Settled-task snapshots retained for `parent_id`.
    pub fn pending_notifications(&self, parent_id: &str) -> Vec<Task> {
        self.ledger.delivered_for(parent_id)
    }

    pub fn clear_notifications(&self, parent_id: &str) {
        self.ledger.clear_delivered(parent_id);
    }

    /// Idempotent teardown: stop polling, release every held slot, cancel
    /// queued waiters, clear all state.
    pub fn shutdown(&self) {
        if self.shutdown_done.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down task orchestrator");

        if let Some(handle) = self.poller.lock().take() {
            handle.abort();
        }

        for r in self.tasks.iter() {
            if let Some(key) = r.value().take_slot() {
                self.controller.release(&key);
            }
        }
        self.controller.clear();
        self.tasks.clear();
        self.ledger.clear_all();
        {
            let mut queues = self.queues.lock();
            queues.by_key.clear();
            queues.draining.clear();
        }
        cleanup::deregister(self.cleanup_id.load(Ordering::SeqCst));
        info!("shutdown complete");
    }

    async fn session_has_output(&self, session_id: &str) -> bool {
        match self.client.messages(session_id).await {
            Ok(messages) => {
                if !messages.iter().any(|m| m.is_agent_output()) {
                    debug!(session_id, "no assistant/tool messages yet");
                    return false;
                }
                let has_content = messages.iter().any(|m| m.has_output_content());
                if !has_content {
                    debug!(session_id, "messages exist but carry no content yet");
                }
                has_content
            }
            // Fail open: a failed fetch does not block completion.
            Err(error) => {
                warn!(
                    session_id,
                    error = %error,
                    "output validation failed, allowing completion"
                );
                true
            }
        }
    }

    async fn has_incomplete_todos(&self, session_id: &str) -> bool {
        match self.client.todos(session_id).await {
            Ok(todos) => todos.iter().any(|todo| todo.status.is_open()),
            // Lookup failures count as no incomplete items.
            Err(_) => false,
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        cleanup::deregister(self.cleanup_id.load(Ordering::SeqCst));
    }
}
