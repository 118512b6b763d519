//! Batched parent notification bookkeeping.
//!
//! A parent with several outstanding tasks gets individual "N still in
//! progress" notes with replies suppressed, then exactly one full summary
//! when its last task settles. Settled tasks are retained for a short window
//! so the parent can fetch results late.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::task::{Task, TaskStatus};

#[derive(Default)]
struct LedgerState {
    /// Parent session id -> ids of tasks not yet individually settled.
    pending_by_parent: HashMap<String, HashSet<String>>,
    /// Parent session id -> settled task snapshots retained for retrieval.
    delivered: HashMap<String, Vec<Task>>,
}

#[derive(Default)]
pub(crate) struct NotificationLedger {
    inner: Mutex<LedgerState>,
}

impl NotificationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a task against its parent. Empty parent ids (tasks
    /// nobody listens for) are ignored.
    pub fn track_pending(&self, parent_id: &str, task_id: &str) {
        if parent_id.is_empty() {
            return;
        }
        self.inner
            .lock()
            .pending_by_parent
            .entry(parent_id.to_string())
            .or_default()
            .insert(task_id.to_string());
    }

    /// Remove a task from its parent's pending set without settling it
    /// (cancellation, deletion, retargeting).
    pub fn forget_pending(&self, parent_id: &str, task_id: &str) {
        if parent_id.is_empty() {
            return;
        }
        let mut state = self.inner.lock();
        if let Some(pending) = state.pending_by_parent.get_mut(parent_id) {
            pending.remove(task_id);
            if pending.is_empty() {
                state.pending_by_parent.remove(parent_id);
            }
        }
    }

    /// Settle a task for notification purposes and report how many of its
    /// parent's tasks remain outstanding.
    pub fn settle(&self, parent_id: &str, task_id: &str) -> usize {
        let mut state = self.inner.lock();
        let Some(pending) = state.pending_by_parent.get_mut(parent_id) else {
            return 0;
        };
        pending.remove(task_id);
        let remaining = pending.len();
        if remaining == 0 {
            state.pending_by_parent.remove(parent_id);
        }
        remaining
    }

    /// Retain a settled task's snapshot for late retrieval.
    pub fn record_delivered(&self, task: Task) {
        self.inner
            .lock()
            .delivered
            .entry(task.parent_session_id.clone())
            .or_default()
            .push(task);
    }

    pub fn delivered_for(&self, parent_id: &str) -> Vec<Task> {
        self.inner
            .lock()
            .delivered
            .get(parent_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear_delivered(&self, parent_id: &str) {
        self.inner.lock().delivered.remove(parent_id);
    }

    /// Drop every retained snapshot of one task (eviction, deletion).
    pub fn drop_delivered_task(&self, task_id: &str) {
        let mut state = self.inner.lock();
        state.delivered.retain(|_, tasks| {
            tasks.retain(|t| t.id != task_id);
            !tasks.is_empty()
        });
    }

    /// Drop retained snapshots older than `ttl`, delivered or not.
    pub fn prune_expired(&self, ttl: Duration, now: DateTime<Utc>) {
        let mut state = self.inner.lock();
        state.delivered.retain(|_, tasks| {
            tasks.retain(|t| {
                let reference = t.started_at.unwrap_or(t.queued_at);
                now.signed_duration_since(reference) <= ttl
            });
            !tasks.is_empty()
        });
    }

    pub fn clear_all(&self) {
        let mut state = self.inner.lock();
        state.pending_by_parent.clear();
        state.delivered.clear();
    }
}

pub(crate) fn format_duration(start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> String {
    let elapsed = end
        .unwrap_or_else(Utc::now)
        .signed_duration_since(start)
        .num_seconds()
        .max(0);
    let seconds = elapsed % 60;
    let minutes = (elapsed / 60) % 60;
    let hours = elapsed / 3600;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Summary sent when a parent's last outstanding task settles. Enumerates
/// every settled task so the parent collects all results in one turn.
pub(crate) fn compose_all_complete(task: &Task, settled: &[Task]) -> String {
    let mut lines: Vec<String> = settled
        .iter()
        .map(|t| format!("- `{}`: {}", t.id, t.description))
        .collect();
    if lines.is_empty() {
        lines.push(format!("- `{}`: {}", task.id, task.description));
    }

    format!(
        "<system-reminder>\n[ALL BACKGROUND TASKS COMPLETE]\n\n**Completed:**\n{}\n\nUse `background_output(task_id=\"<id>\")` to retrieve each result.\n</system-reminder>",
        lines.join("\n")
    )
}

/// Individual settlement note while the parent still has work outstanding.
pub(crate) fn compose_remaining(task: &Task, remaining: usize) -> String {
    let status_text = if task.status == TaskStatus::Error {
        "FAILED"
    } else {
        "COMPLETED"
    };
    let duration = format_duration(
        task.started_at.unwrap_or(task.queued_at),
        task.completed_at,
    );
    let error_info = task
        .error
        .as_deref()
        .map(|e| format!("\n**Error:** {}", e))
        .unwrap_or_default();
    let plural = if remaining == 1 { "task" } else { "tasks" };

    format!(
        "<system-reminder>\n[BACKGROUND TASK {status}]\n**ID:** `{id}`\n**Description:** {description}\n**Duration:** {duration}{error_info}\n\n**{remaining} {plural} still in progress.** You WILL be notified when ALL complete.\nDo NOT poll - continue productive work.\n\nUse `background_output(task_id=\"{id}\")` to retrieve this result when ready.\n</system-reminder>",
        status = status_text,
        id = task.id,
        description = task.description,
        duration = duration,
        error_info = error_info,
        remaining = remaining,
        plural = plural,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settled_task(id: &str, parent: &str, status: TaskStatus) -> Task {
        let now = Utc::now();
        Task {
            id: id.to_string(),
            status,
            queued_at: now - Duration::seconds(95),
            started_at: Some(now - Duration::seconds(90)),
            completed_at: Some(now),
            description: format!("work for {}", id),
            prompt: String::new(),
            agent: "explore".to_string(),
            model: None,
            parent_session_id: parent.to_string(),
            parent_message_id: String::new(),
            parent_agent: None,
            parent_model: None,
            session_id: Some(format!("sess-{}", id)),
            concurrency_key: None,
            concurrency_group: Some("explore".to_string()),
            progress: None,
            error: if status == TaskStatus::Error {
                Some("boom".to_string())
            } else {
                None
            },
        }
    }

    #[test]
    fn settle_counts_down_per_parent() {
        let ledger = NotificationLedger::new();
        ledger.track_pending("parent-1", "bg_a");
        ledger.track_pending("parent-1", "bg_b");
        ledger.track_pending("parent-2", "bg_c");

        assert_eq!(ledger.settle("parent-1", "bg_a"), 1);
        assert_eq!(ledger.settle("parent-1", "bg_b"), 0);
        assert_eq!(ledger.settle("parent-2", "bg_c"), 0);
        // Already-settled parents report nothing outstanding.
        assert_eq!(ledger.settle("parent-1", "bg_a"), 0);
    }

    #[test]
    fn forget_pending_drops_empty_sets() {
        let ledger = NotificationLedger::new();
        ledger.track_pending("parent-1", "bg_a");
        ledger.forget_pending("parent-1", "bg_a");
        assert_eq!(ledger.settle("parent-1", "bg_b"), 0);
    }

    #[test]
    fn delivered_snapshots_are_retained_and_droppable() {
        let ledger = NotificationLedger::new();
        ledger.record_delivered(settled_task("bg_a", "parent-1", TaskStatus::Completed));
        ledger.record_delivered(settled_task("bg_b", "parent-1", TaskStatus::Error));

        assert_eq!(ledger.delivered_for("parent-1").len(), 2);

        ledger.drop_delivered_task("bg_a");
        let remaining = ledger.delivered_for("parent-1");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "bg_b");

        ledger.clear_delivered("parent-1");
        assert!(ledger.delivered_for("parent-1").is_empty());
    }

    #[test]
    fn prune_expired_drops_old_snapshots() {
        let ledger = NotificationLedger::new();
        let mut old = settled_task("bg_old", "parent-1", TaskStatus::Completed);
        old.started_at = Some(Utc::now() - Duration::minutes(45));
        ledger.record_delivered(old);
        ledger.record_delivered(settled_task("bg_new", "parent-1", TaskStatus::Completed));

        ledger.prune_expired(Duration::minutes(30), Utc::now());
        let kept = ledger.delivered_for("parent-1");
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "bg_new");
    }

    #[test]
    fn format_duration_buckets() {
        let now = Utc::now();
        assert_eq!(format_duration(now - Duration::seconds(42), Some(now)), "42s");
        assert_eq!(
            format_duration(now - Duration::seconds(150), Some(now)),
            "2m 30s"
        );
        assert_eq!(
            format_duration(now - Duration::seconds(3723), Some(now)),
            "1h 2m 3s"
        );
    }

    #[test]
    fn all_complete_enumerates_settled_tasks() {
        let task = settled_task("bg_a", "parent-1", TaskStatus::Completed);
        let others = vec![
            settled_task("bg_a", "parent-1", TaskStatus::Completed),
            settled_task("bg_b", "parent-1", TaskStatus::Error),
        ];
        let text = compose_all_complete(&task, &others);
        assert!(text.contains("ALL BACKGROUND TASKS COMPLETE"));
        assert!(text.contains("`bg_a`"));
        assert!(text.contains("`bg_b`"));
    }

    #[test]
    fn remaining_note_carries_status_and_count() {
        let task = settled_task("bg_a", "parent-1", TaskStatus::Error);
        let text = compose_remaining(&task, 2);
        assert!(text.contains("BACKGROUND TASK FAILED"));
        assert!(text.contains("**Error:** boom"));
        assert!(text.contains("2 tasks still in progress"));

        let ok = settled_task("bg_b", "parent-1", TaskStatus::Completed);
        let text = compose_remaining(&ok, 1);
        assert!(text.contains("BACKGROUND TASK COMPLETED"));
        assert!(text.contains("1 task still in progress"));
    }
}
