//! Queue data model: tasks, statuses and the persisted document.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::QueueError;

/// Current on-disk schema version.
pub const DOCUMENT_VERSION: u32 = 1;

/// Transition history kept per task.
const MAX_HISTORY: usize = 50;

/// Validated task identifier.
///
/// Only `[A-Za-z0-9_.-]` is accepted so ids are safe inside file names,
/// session commands and log lines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(String);

impl TaskId {
    /// Parse an externally supplied id.
    pub fn parse(raw: impl Into<String>) -> Result<Self, QueueError> {
        let raw = raw.into();
        if raw.is_empty() || raw.len() > 128 {
            return Err(QueueError::Validation(format!(
                "task id must be 1-128 characters, got {}",
                raw.len()
            )));
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(QueueError::Validation(format!(
                "task id {raw:?} contains unsafe character {bad:?}"
            )));
        }
        Ok(Self(raw))
    }

    /// Fresh id for a task of the given type, e.g. `custom-3f2a9c1d04b7`.
    pub fn generate(task_type: TaskType) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", task_type.id_prefix(), &suffix[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TaskId {
    type Error = QueueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a task came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Custom,
    GithubIssue,
    GithubPr,
}

impl TaskType {
    fn id_prefix(self) -> &'static str {
        match self {
            Self::Custom => "custom",
            Self::GithubIssue => "issue",
            Self::GithubPr => "pr",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Custom => "custom",
            Self::GithubIssue => "github_issue",
            Self::GithubPr => "github_pr",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed and handed to the assistant.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Gave up after errors.
    Failed,
    /// Gave up after inactivity.
    Timeout,
}

impl TaskStatus {
    /// Whether a generic transition is allowed.
    ///
    /// Reopening a terminal task is not a generic transition; it goes
    /// through `TaskQueue::requeue`.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, InProgress) | (Pending, Failed) |
            (InProgress, Completed) | (InProgress, Failed) |
            (InProgress, Timeout) | (InProgress, Pending)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

/// Link back to an issue-tracker item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerRef {
    /// `owner/name` of the repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    /// Issue or PR number.
    pub number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A recorded status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// A unit of submitted work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    /// Lower value is served first.
    pub priority: i64,
    /// Prompt text or a structured object with a `prompt`/`title`.
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Consecutive usage-limit preemptions since the last real attempt.
    #[serde(default)]
    pub limit_hits: u32,
    /// Task-level override of the global context-clearing default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clear_context: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracker: Option<TrackerRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<StateTransition>,
    /// Fields written by newer versions or other tools; kept on rewrite.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Task {
    /// Create a pending task.
    pub fn new(task_type: TaskType, priority: i64, payload: Value, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::generate(task_type),
            task_type,
            status: TaskStatus::Pending,
            priority,
            payload,
            created_at: now,
            last_modified: now,
            retry_count: 0,
            last_error: None,
            error_code: None,
            limit_hits: 0,
            clear_context: None,
            tracker: None,
            history: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Builder: set the context-clearing preference.
    pub fn with_clear_context(mut self, clear: bool) -> Self {
        self.clear_context = Some(clear);
        self
    }

    /// Builder: attach tracker metadata.
    pub fn with_tracker(mut self, tracker: TrackerRef) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Text handed to the assistant.
    pub fn prompt(&self) -> String {
        match &self.payload {
            Value::String(s) => s.clone(),
            Value::Object(obj) => {
                if let Some(prompt) = obj.get("prompt").and_then(Value::as_str) {
                    return prompt.to_string();
                }
                let title = obj.get("title").and_then(Value::as_str).unwrap_or_default();
                match obj.get("body").and_then(Value::as_str) {
                    Some(body) if !body.is_empty() => format!("{title}\n\n{body}"),
                    _ => title.to_string(),
                }
            }
            other => other.to_string(),
        }
    }

    /// Apply a generic transition, recording the note and timestamp.
    pub(crate) fn transition_to(
        &mut self,
        target: TaskStatus,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        if !self.status.can_transition_to(target) {
            return Err(QueueError::InvalidTransition {
                id: self.id.to_string(),
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }
        self.force_status(target, note, now);
        Ok(())
    }

    /// Set the status without checking the state machine (requeue path).
    pub(crate) fn force_status(
        &mut self,
        target: TaskStatus,
        note: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.history.push(StateTransition {
            from: self.status,
            to: target,
            at: now,
            note,
        });
        if self.history.len() > MAX_HISTORY {
            let drain_count = self.history.len() - MAX_HISTORY;
            self.history.drain(..drain_count);
        }
        self.status = target;
        self.last_modified = now;
    }
}

/// Per-status task counts, recomputed on every save.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub timeout: usize,
}

impl QueueCounts {
    pub fn tally(tasks: &[Task]) -> Self {
        let mut counts = Self {
            total: tasks.len(),
            ..Self::default()
        };
        for task in tasks {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Timeout => counts.timeout += 1,
            }
        }
        counts
    }
}

/// Document-level bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMetadata {
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub counts: QueueCounts,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The persisted queue: one per project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueDocument {
    pub version: u32,
    #[serde(default)]
    pub tasks: Vec<Task>,
    pub metadata: QueueMetadata,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl QueueDocument {
    /// Empty document stamped with `now`.
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            version: DOCUMENT_VERSION,
            tasks: Vec::new(),
            metadata: QueueMetadata {
                created_at: now,
                last_modified: now,
                counts: QueueCounts::default(),
                extra: Map::new(),
            },
            extra: Map::new(),
        }
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Result<&mut Task, QueueError> {
        self.tasks
            .iter_mut()
            .find(|t| &t.id == id)
            .ok_or_else(|| QueueError::NotFound { id: id.to_string() })
    }

    /// Refresh counts and the modification stamp before writing.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.metadata.counts = QueueCounts::tally(&self.tasks);
        self.metadata.last_modified = now;
    }

    /// Index of the next task to serve: minimal priority, then document order.
    pub fn next_pending_index(&self) -> Option<usize> {
        self.tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status == TaskStatus::Pending)
            .min_by_key(|(idx, t)| (t.priority, *idx))
            .map(|(idx, _)| idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_valid() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Pending));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Timeout));
    }

    #[test]
    fn status_transitions_invalid() {
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::InProgress));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Timeout.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn task_id_rejects_unsafe_characters() {
        assert!(TaskId::parse("issue-42").is_ok());
        assert!(TaskId::parse("a/b").is_err());
        assert!(TaskId::parse("rm -rf").is_err());
        assert!(TaskId::parse("").is_err());
    }

    #[test]
    fn generated_ids_carry_type_prefix() {
        let id = TaskId::generate(TaskType::GithubPr);
        assert!(id.as_str().starts_with("pr-"));
        assert!(TaskId::parse(id.as_str()).is_ok());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        assert_eq!(TaskStatus::InProgress.to_string(), "in_progress");
    }

    #[test]
    fn unknown_fields_survive_rewrite() {
        let raw = serde_json::json!({
            "version": 1,
            "tasks": [{
                "id": "custom-1",
                "type": "custom",
                "status": "pending",
                "priority": 2,
                "payload": "do it",
                "created_at": "2025-01-01T00:00:00Z",
                "last_modified": "2025-01-01T00:00:00Z",
                "labels": ["sync"]
            }],
            "metadata": {
                "created_at": "2025-01-01T00:00:00Z",
                "last_modified": "2025-01-01T00:00:00Z",
                "source": "tracker"
            },
            "owner": "ci"
        });
        let doc: QueueDocument = serde_json::from_value(raw).unwrap();
        let back = serde_json::to_value(&doc).unwrap();
        assert_eq!(back["owner"], "ci");
        assert_eq!(back["metadata"]["source"], "tracker");
        assert_eq!(back["tasks"][0]["labels"][0], "sync");
    }

    #[test]
    fn prompt_from_structured_payload() {
        let now = Utc::now();
        let task = Task::new(
            TaskType::GithubIssue,
            1,
            serde_json::json!({"title": "Fix login", "body": "Steps..."}),
            now,
        );
        assert_eq!(task.prompt(), "Fix login\n\nSteps...");

        let task = Task::new(TaskType::Custom, 1, serde_json::json!({"prompt": "Run tests"}), now);
        assert_eq!(task.prompt(), "Run tests");
    }

    #[test]
    fn history_is_capped() {
        let now = Utc::now();
        let mut task = Task::new(TaskType::Custom, 1, Value::from("x"), now);
        for _ in 0..40 {
            task.transition_to(TaskStatus::InProgress, None, now).unwrap();
            task.transition_to(TaskStatus::Pending, None, now).unwrap();
        }
        assert_eq!(task.history.len(), MAX_HISTORY);
    }

    #[test]
    fn next_pending_prefers_priority_then_order() {
        let now = Utc::now();
        let mut doc = QueueDocument::empty(now);
        doc.tasks.push(Task::new(TaskType::Custom, 5, Value::from("a"), now));
        doc.tasks.push(Task::new(TaskType::Custom, 2, Value::from("b"), now));
        doc.tasks.push(Task::new(TaskType::Custom, 2, Value::from("c"), now));
        assert_eq!(doc.next_pending_index(), Some(1));
    }
}
