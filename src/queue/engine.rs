//! Task queue engine: every operation the orchestrator and submitters use.
//!
//! Each mutation acquires the project lock, re-reads the on-disk document,
//! applies its change and writes the result back before releasing. A failed
//! mutation writes nothing, so the previous document stays intact. Other
//! writers (the tracker sync, a second autopilot process, a CLI submission)
//! are tolerated between operations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::clock::{self, Clock};
use crate::config::AutopilotConfig;
use crate::error::QueueError;
use crate::queue::lock::ProjectLock;
use crate::queue::model::{
    QueueCounts, QueueDocument, Task, TaskId, TaskStatus, TaskType, TrackerRef,
};
use crate::queue::store::QueueStore;

/// Knobs the engine needs from configuration.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub lock_timeout: Duration,
    pub max_retries: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(10),
            max_retries: 3,
        }
    }
}

impl From<&AutopilotConfig> for QueueSettings {
    fn from(config: &AutopilotConfig) -> Self {
        Self {
            lock_timeout: config.lock_timeout,
            max_retries: config.max_retries,
        }
    }
}

/// What happened to a task after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Back in the queue for another try.
    Retrying { retry_count: u32 },
    /// Retries exhausted; the task reached this terminal status.
    GaveUp { status: TaskStatus },
}

/// Project task queue.
pub struct TaskQueue {
    store: QueueStore,
    lock: ProjectLock,
    settings: QueueSettings,
    clock: Arc<dyn Clock>,
}

impl TaskQueue {
    /// Queue stored in `state_dir`.
    pub fn new(
        state_dir: impl Into<PathBuf>,
        settings: QueueSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = QueueStore::new(state_dir);
        let lock = ProjectLock::new(store.lock_path());
        Self {
            store,
            lock,
            settings,
            clock,
        }
    }

    /// Queue for the project named in `config`, on the system clock.
    pub fn from_config(config: &AutopilotConfig) -> Self {
        Self::new(config.state_dir(), QueueSettings::from(config), clock::system())
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    pub fn max_retries(&self) -> u32 {
        self.settings.max_retries
    }

    /// Locked read-modify-write of the live document.
    async fn mutate<T, F>(&self, op: F) -> Result<T, QueueError>
    where
        F: FnOnce(&mut QueueDocument, DateTime<Utc>) -> Result<T, QueueError>,
    {
        let _guard = self.lock.acquire(self.settings.lock_timeout).await?;
        let now = self.clock.now();
        let mut doc = self
            .store
            .read()
            .await?
            .unwrap_or_else(|| QueueDocument::empty(now));

        let out = op(&mut doc, now)?;

        doc.touch(now);
        self.store.write(&doc).await?;
        Ok(out)
    }

    // ── Submission ──────────────────────────────────────────────────

    /// Submit a new pending task.
    pub async fn add_task(
        &self,
        task_type: TaskType,
        priority: i64,
        payload: Value,
    ) -> Result<TaskId, QueueError> {
        let task = Task::new(task_type, priority, payload, self.clock.now());
        self.add(task).await
    }

    /// Submit a fully built task (e.g. one carrying `clear_context`).
    pub async fn add(&self, mut task: Task) -> Result<TaskId, QueueError> {
        validate_priority(task.priority)?;
        validate_payload(&task.payload)?;

        self.mutate(move |doc, now| {
            while doc.get(&task.id).is_some() {
                task.id = TaskId::generate(task.task_type);
            }
            task.status = TaskStatus::Pending;
            task.created_at = now;
            task.last_modified = now;

            let id = task.id.clone();
            info!(
                task_id = %id,
                task_type = %task.task_type,
                priority = task.priority,
                "Task added"
            );
            doc.tasks.push(task);
            Ok(id)
        })
        .await
    }

    /// Submit a tracker item unless the same item is already queued.
    ///
    /// Returns the task id and whether a new task was created.
    pub async fn add_tracker_task(
        &self,
        task_type: TaskType,
        tracker: TrackerRef,
        priority: i64,
        payload: Value,
    ) -> Result<(TaskId, bool), QueueError> {
        if task_type == TaskType::Custom {
            return Err(QueueError::Validation(
                "tracker tasks must be github_issue or github_pr".to_string(),
            ));
        }
        validate_priority(priority)?;
        validate_payload(&payload)?;

        self.mutate(move |doc, now| {
            if let Some(existing) = find_tracker(doc, task_type, &tracker) {
                debug!(
                    task_id = %existing.id,
                    number = tracker.number,
                    "Tracker item already queued"
                );
                return Ok((existing.id.clone(), false));
            }
            let mut task = Task::new(task_type, priority, payload, now).with_tracker(tracker);
            while doc.get(&task.id).is_some() {
                task.id = TaskId::generate(task_type);
            }
            let id = task.id.clone();
            info!(task_id = %id, task_type = %task_type, "Tracker task added");
            doc.tasks.push(task);
            Ok((id, true))
        })
        .await
    }

    // ── Claiming and transitions ────────────────────────────────────

    /// Claim the most urgent pending task, marking it `in_progress`.
    ///
    /// Selection and the status change happen under one lock acquisition, so
    /// concurrent claimers never receive the same task. Returns `None`
    /// immediately when nothing is pending.
    pub async fn claim_next(&self) -> Result<Option<Task>, QueueError> {
        self.mutate(|doc, now| {
            let Some(idx) = doc.next_pending_index() else {
                return Ok(None);
            };
            let task = &mut doc.tasks[idx];
            task.transition_to(TaskStatus::InProgress, Some("claimed".to_string()), now)?;
            info!(task_id = %task.id, priority = task.priority, "Task claimed");
            Ok(Some(task.clone()))
        })
        .await
    }

    /// The task `claim_next` would return, without claiming it.
    pub async fn peek_next(&self) -> Result<Option<Task>, QueueError> {
        let doc = self.load().await?;
        Ok(doc.next_pending_index().map(|idx| doc.tasks[idx].clone()))
    }

    /// Generic state-machine transition.
    pub async fn transition(
        &self,
        id: &TaskId,
        status: TaskStatus,
        note: impl Into<String>,
    ) -> Result<(), QueueError> {
        let note = note.into();
        self.mutate(|doc, now| {
            let task = doc.get_mut(id)?;
            let from = task.status;
            task.transition_to(status, Some(note), now)?;
            if status == TaskStatus::Completed {
                task.limit_hits = 0;
            }
            info!(task_id = %id, %from, to = %status, "Task transitioned");
            Ok(())
        })
        .await
    }

    /// Reopen a task, including terminal ones. Resets retry bookkeeping.
    pub async fn requeue(&self, id: &TaskId, note: impl Into<String>) -> Result<(), QueueError> {
        let note = note.into();
        self.mutate(|doc, now| {
            let task = doc.get_mut(id)?;
            if task.status == TaskStatus::Pending {
                return Ok(());
            }
            let from = task.status;
            task.force_status(TaskStatus::Pending, Some(note), now);
            task.retry_count = 0;
            task.limit_hits = 0;
            task.last_error = None;
            task.error_code = None;
            info!(task_id = %id, %from, "Task requeued");
            Ok(())
        })
        .await
    }

    /// Return a running task to the queue because a usage limit hit.
    ///
    /// Not counted as a retry. Returns the number of consecutive preemptions.
    pub async fn preempt_for_limit(
        &self,
        id: &TaskId,
        note: impl Into<String>,
    ) -> Result<u32, QueueError> {
        let note = note.into();
        self.mutate(|doc, now| {
            let task = doc.get_mut(id)?;
            task.transition_to(TaskStatus::Pending, Some(note), now)?;
            task.limit_hits += 1;
            info!(task_id = %id, limit_hits = task.limit_hits, "Task preempted by usage limit");
            Ok(task.limit_hits)
        })
        .await
    }

    // ── Errors and retries ──────────────────────────────────────────

    /// Record the latest error on a task.
    pub async fn record_error(
        &self,
        id: &TaskId,
        message: impl Into<String>,
        code: Option<&str>,
    ) -> Result<(), QueueError> {
        let message = message.into();
        let code = code.map(str::to_string);
        self.mutate(|doc, now| {
            let task = doc.get_mut(id)?;
            warn!(
                task_id = %id,
                code = code.as_deref().unwrap_or("-"),
                error = %message,
                "Task error recorded"
            );
            task.last_error = Some(message);
            task.error_code = code;
            task.last_modified = now;
            Ok(())
        })
        .await
    }

    /// Bump the retry counter. Returns the new count.
    pub async fn increment_retry(&self, id: &TaskId) -> Result<u32, QueueError> {
        self.mutate(|doc, now| {
            let task = doc.get_mut(id)?;
            task.retry_count += 1;
            task.last_modified = now;
            Ok(task.retry_count)
        })
        .await
    }

    /// `retry_count < max_retries`.
    pub async fn check_retry_eligible(&self, id: &TaskId) -> Result<bool, QueueError> {
        let task = self.get_task(id).await?;
        Ok(task.retry_count < self.settings.max_retries)
    }

    /// Record a failed attempt of a running task in one locked cycle.
    ///
    /// Combines `record_error`, `increment_retry` and the follow-up
    /// transition: back to `pending` while retries remain, otherwise to
    /// `terminal` (`failed` or `timeout`). The first attempt is not a retry,
    /// so a task gives up on failure number `max_retries + 1`.
    pub async fn fail_attempt(
        &self,
        id: &TaskId,
        message: impl Into<String>,
        code: Option<&str>,
        terminal: TaskStatus,
    ) -> Result<AttemptOutcome, QueueError> {
        if !matches!(terminal, TaskStatus::Failed | TaskStatus::Timeout) {
            return Err(QueueError::Validation(format!(
                "attempt failure cannot end in {terminal}"
            )));
        }
        let message = message.into();
        let code = code.map(str::to_string);
        let max_retries = self.settings.max_retries;

        self.mutate(|doc, now| {
            let task = doc.get_mut(id)?;
            let eligible = task.retry_count < max_retries;
            task.last_error = Some(message.clone());
            task.error_code = code;
            task.retry_count += 1;
            task.limit_hits = 0;

            if eligible {
                task.transition_to(TaskStatus::Pending, Some(format!("retry: {message}")), now)?;
                warn!(
                    task_id = %id,
                    retry_count = task.retry_count,
                    max_retries,
                    "Task failed, will retry"
                );
                Ok(AttemptOutcome::Retrying {
                    retry_count: task.retry_count,
                })
            } else {
                task.transition_to(terminal, Some(message), now)?;
                warn!(
                    task_id = %id,
                    status = %terminal,
                    retry_count = task.retry_count,
                    "Task gave up"
                );
                Ok(AttemptOutcome::GaveUp { status: terminal })
            }
        })
        .await
    }

    /// Fail a task outright, bypassing the retry budget.
    pub async fn give_up(
        &self,
        id: &TaskId,
        message: impl Into<String>,
        code: Option<&str>,
    ) -> Result<(), QueueError> {
        let message = message.into();
        let code = code.map(str::to_string);
        self.mutate(|doc, now| {
            let task = doc.get_mut(id)?;
            task.transition_to(TaskStatus::Failed, Some(message.clone()), now)?;
            warn!(
                task_id = %id,
                code = code.as_deref().unwrap_or("-"),
                error = %message,
                "Task abandoned"
            );
            task.last_error = Some(message);
            task.error_code = code;
            Ok(())
        })
        .await
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub async fn get_task(&self, id: &TaskId) -> Result<Task, QueueError> {
        self.load()
            .await?
            .get(id)
            .cloned()
            .ok_or_else(|| QueueError::NotFound { id: id.to_string() })
    }

    /// Tasks in document order, optionally filtered by status.
    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, QueueError> {
        let doc = self.load().await?;
        Ok(doc
            .tasks
            .into_iter()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .collect())
    }

    pub async fn counts(&self) -> Result<QueueCounts, QueueError> {
        Ok(QueueCounts::tally(&self.load().await?.tasks))
    }

    pub async fn find_by_tracker(
        &self,
        task_type: TaskType,
        tracker: &TrackerRef,
    ) -> Result<Option<Task>, QueueError> {
        let doc = self.load().await?;
        Ok(find_tracker(&doc, task_type, tracker).cloned())
    }

    // ── Whole-document persistence ──────────────────────────────────

    /// Current document; empty when none has been written yet.
    ///
    /// Fails with `CorruptState` when the file cannot be parsed.
    pub async fn load(&self) -> Result<QueueDocument, QueueError> {
        Ok(self
            .store
            .read()
            .await?
            .unwrap_or_else(|| QueueDocument::empty(self.clock.now())))
    }

    /// Replace the live document with `doc`.
    pub async fn save(&self, doc: &QueueDocument) -> Result<(), QueueError> {
        let _guard = self.lock.acquire(self.settings.lock_timeout).await?;
        let mut doc = doc.clone();
        doc.touch(self.clock.now());
        self.store.write(&doc).await
    }

    // ── Backups ─────────────────────────────────────────────────────

    /// Snapshot the live document.
    pub async fn backup(&self, label: &str) -> Result<PathBuf, QueueError> {
        let _guard = self.lock.acquire(self.settings.lock_timeout).await?;
        let now = self.clock.now();
        let doc = self
            .store
            .read()
            .await?
            .unwrap_or_else(|| QueueDocument::empty(now));
        let path = self.store.write_backup(&doc, label, now).await?;
        info!(path = %path.display(), label, "Queue backed up");
        Ok(path)
    }

    /// Replace the live document with a snapshot, if the snapshot parses.
    pub async fn recover_from_backup(&self, path: &Path) -> Result<QueueDocument, QueueError> {
        let snapshot = self.store.read_snapshot(path).await?;

        let _guard = self.lock.acquire(self.settings.lock_timeout).await?;
        let now = self.clock.now();
        match self.store.read().await {
            Ok(Some(current)) => {
                self.store.write_backup(&current, "pre-restore", now).await?;
            }
            Ok(None) => {}
            Err(QueueError::CorruptState { .. }) => {
                self.store.quarantine(now).await?;
            }
            Err(e) => return Err(e),
        }
        self.store.write(&snapshot).await?;
        info!(path = %path.display(), tasks = snapshot.tasks.len(), "Queue restored from backup");
        Ok(snapshot)
    }

    pub async fn list_backups(&self) -> Result<Vec<PathBuf>, QueueError> {
        self.store.list_backups().await
    }

    pub async fn latest_backup(&self) -> Result<Option<PathBuf>, QueueError> {
        Ok(self.store.list_backups().await?.pop())
    }

    pub async fn prune_backups(&self, retention_days: u32) -> Result<usize, QueueError> {
        self.store.prune_backups(retention_days, self.clock.now()).await
    }

    /// Load the document, restoring the newest parseable snapshot if the
    /// live file is corrupt.
    ///
    /// Fails with `NoBackup` when there is nothing to restore from and with
    /// the original `CorruptState` when no snapshot parses.
    pub async fn load_or_recover(&self) -> Result<QueueDocument, QueueError> {
        let corrupt = match self.load().await {
            Ok(doc) => return Ok(doc),
            Err(e @ QueueError::CorruptState { .. }) => e,
            Err(e) => return Err(e),
        };
        warn!(error = %corrupt, "Queue document unreadable, trying backups");

        let snapshots = self.store.list_backups().await?;
        if snapshots.is_empty() {
            return Err(QueueError::NoBackup {
                dir: self.store.backups_dir(),
            });
        }
        for path in snapshots.into_iter().rev() {
            match self.recover_from_backup(&path).await {
                Ok(doc) => return Ok(doc),
                Err(QueueError::CorruptState { path, reason }) => {
                    warn!(
                        path = %path.display(),
                        %reason,
                        "Snapshot unusable, trying an older one"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Err(corrupt)
    }

    // ── Maintenance ─────────────────────────────────────────────────

    /// Remove `completed`/`failed`/`timeout` tasks untouched for longer than
    /// `retention_days`. Pending and running tasks are never removed.
    pub async fn cleanup_old(&self, retention_days: u32) -> Result<usize, QueueError> {
        let _guard = self.lock.acquire(self.settings.lock_timeout).await?;
        let now = self.clock.now();
        let Some(mut doc) = self.store.read().await? else {
            return Ok(0);
        };
        let cutoff = now - chrono::Duration::days(i64::from(retention_days));

        let expired = |t: &Task| {
            matches!(
                t.status,
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout
            ) && t.last_modified < cutoff
        };
        let removed = doc.tasks.iter().filter(|&t| expired(t)).count();
        if removed == 0 {
            return Ok(0);
        }

        self.store.write_backup(&doc, "before-cleanup", now).await?;
        doc.tasks.retain(|t| !expired(t));
        doc.touch(now);
        self.store.write(&doc).await?;
        info!(removed, retention_days, "Cleaned up old tasks");
        Ok(removed)
    }

    /// Return tasks left `in_progress` by a crashed run to `pending`.
    pub async fn reset_stale_in_progress(&self, note: &str) -> Result<Vec<TaskId>, QueueError> {
        let reset = self
            .mutate(|doc, now| {
                let mut reset = Vec::new();
                for task in doc
                    .tasks
                    .iter_mut()
                    .filter(|t| t.status == TaskStatus::InProgress)
                {
                    task.transition_to(TaskStatus::Pending, Some(note.to_string()), now)?;
                    reset.push(task.id.clone());
                }
                Ok(reset)
            })
            .await?;
        if !reset.is_empty() {
            info!(count = reset.len(), "Reset stale in_progress tasks to pending");
        }
        Ok(reset)
    }
}

fn find_tracker<'a>(
    doc: &'a QueueDocument,
    task_type: TaskType,
    tracker: &TrackerRef,
) -> Option<&'a Task> {
    doc.tasks.iter().find(|t| {
        t.task_type == task_type
            && t.tracker
                .as_ref()
                .is_some_and(|r| r.number == tracker.number && r.repo == tracker.repo)
    })
}

fn validate_priority(priority: i64) -> Result<(), QueueError> {
    if priority < 1 {
        return Err(QueueError::Validation(format!(
            "priority must be a positive integer, got {priority}"
        )));
    }
    Ok(())
}

fn validate_payload(payload: &Value) -> Result<(), QueueError> {
    let non_empty =
        |v: Option<&Value>| v.and_then(Value::as_str).is_some_and(|s| !s.trim().is_empty());
    let ok = match payload {
        Value::String(s) => !s.trim().is_empty(),
        Value::Object(obj) => non_empty(obj.get("prompt")) || non_empty(obj.get("title")),
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(QueueError::Validation(
            "payload must be a non-empty string or an object with a prompt or title".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue(dir: &Path) -> TaskQueue {
        TaskQueue::new(dir, QueueSettings::default(), clock::system())
    }

    #[tokio::test]
    async fn add_rejects_bad_input_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());

        let err = q.add_task(TaskType::Custom, 0, json!("x")).await.unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
        let err = q.add_task(TaskType::Custom, 1, json!({"labels": []})).await.unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
        let err = q.add_task(TaskType::Custom, 1, json!("   ")).await.unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));

        assert!(q.store().read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());

        let mut ids = std::collections::HashSet::new();
        for i in 0..25 {
            let id = q.add_task(TaskType::Custom, 1, json!(format!("task {i}"))).await.unwrap();
            assert!(ids.insert(id));
        }
        assert_eq!(q.counts().await.unwrap().pending, 25);
    }

    #[tokio::test]
    async fn claim_order_is_priority_then_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());

        let low = q.add_task(TaskType::Custom, 5, json!("low")).await.unwrap();
        let first = q.add_task(TaskType::Custom, 1, json!("first")).await.unwrap();
        let second = q.add_task(TaskType::Custom, 1, json!("second")).await.unwrap();

        assert_eq!(q.claim_next().await.unwrap().unwrap().id, first);
        assert_eq!(q.claim_next().await.unwrap().unwrap().id, second);
        assert_eq!(q.claim_next().await.unwrap().unwrap().id, low);
        assert!(q.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn completed_cannot_go_back_without_requeue() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        let id = q.add_task(TaskType::Custom, 1, json!("x")).await.unwrap();
        q.claim_next().await.unwrap();
        q.transition(&id, TaskStatus::Completed, "done").await.unwrap();

        let err = q.transition(&id, TaskStatus::Pending, "again").await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));
        assert_eq!(q.get_task(&id).await.unwrap().status, TaskStatus::Completed);

        q.requeue(&id, "operator asked").await.unwrap();
        let task = q.get_task(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.history.last().unwrap().note.as_deref(), Some("operator asked"));
    }

    #[tokio::test]
    async fn retry_bound_reaches_failed() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        let id = q.add_task(TaskType::Custom, 1, json!("flaky")).await.unwrap();

        let max = q.max_retries();
        for attempt in 1..=max {
            q.claim_next().await.unwrap().unwrap();
            let outcome = q
                .fail_attempt(&id, "boom", Some("exec"), TaskStatus::Failed)
                .await
                .unwrap();
            assert_eq!(outcome, AttemptOutcome::Retrying { retry_count: attempt });
        }

        q.claim_next().await.unwrap().unwrap();
        let outcome = q.fail_attempt(&id, "boom", None, TaskStatus::Failed).await.unwrap();
        assert_eq!(outcome, AttemptOutcome::GaveUp { status: TaskStatus::Failed });

        let task = q.get_task(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(!q.check_retry_eligible(&id).await.unwrap());
        assert!(q.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn record_error_and_increment_retry_are_separate_ops() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        let id = q.add_task(TaskType::Custom, 1, json!("x")).await.unwrap();

        q.record_error(&id, "bad output", Some("E42")).await.unwrap();
        assert_eq!(q.increment_retry(&id).await.unwrap(), 1);

        let task = q.get_task(&id).await.unwrap();
        assert_eq!(task.last_error.as_deref(), Some("bad output"));
        assert_eq!(task.error_code.as_deref(), Some("E42"));
        assert!(q.check_retry_eligible(&id).await.unwrap());
    }

    #[tokio::test]
    async fn limit_preemption_is_not_a_retry() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        let id = q.add_task(TaskType::Custom, 1, json!("x")).await.unwrap();
        q.claim_next().await.unwrap();

        assert_eq!(q.preempt_for_limit(&id, "usage limit").await.unwrap(), 1);
        let task = q.get_task(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
    }

    #[tokio::test]
    async fn give_up_skips_retry_budget() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        let id = q.add_task(TaskType::Custom, 1, json!("x")).await.unwrap();
        q.claim_next().await.unwrap();

        q.give_up(&id, "limit hit five times", Some("limit_exhausted"))
            .await
            .unwrap();
        let task = q.get_task(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_code.as_deref(), Some("limit_exhausted"));
        assert_eq!(task.retry_count, 0);
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        q.add_task(TaskType::Custom, 2, json!({"prompt": "a", "extra": 1})).await.unwrap();
        q.add_task(TaskType::GithubIssue, 1, json!({"title": "b"})).await.unwrap();

        let mut doc = q.load().await.unwrap();
        doc.tasks[0].clear_context = Some(false);
        q.save(&doc).await.unwrap();

        let loaded = q.load().await.unwrap();
        assert_eq!(loaded.tasks, doc.tasks);
        assert_eq!(loaded.metadata.counts.pending, 2);
    }

    #[tokio::test]
    async fn corrupt_document_recovers_from_latest_backup() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        let id = q.add_task(TaskType::Custom, 1, json!("keep me")).await.unwrap();
        q.backup("scheduled").await.unwrap();

        std::fs::write(q.store().queue_path(), b"not json at all").unwrap();
        assert!(matches!(q.load().await, Err(QueueError::CorruptState { .. })));

        let latest = q.latest_backup().await.unwrap().unwrap();
        q.recover_from_backup(&latest).await.unwrap();

        let doc = q.load().await.unwrap();
        assert_eq!(doc.tasks.len(), 1);
        assert_eq!(doc.tasks[0].id, id);
    }

    #[tokio::test]
    async fn unparseable_snapshot_is_not_restored() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        q.add_task(TaskType::Custom, 1, json!("live")).await.unwrap();

        let bad = dir.path().join("backups/queue-20250101T000000.000Z-bad.json");
        std::fs::create_dir_all(bad.parent().unwrap()).unwrap();
        std::fs::write(&bad, b"{").unwrap();

        let err = q.recover_from_backup(&bad).await.unwrap_err();
        assert!(matches!(err, QueueError::CorruptState { .. }));
        assert_eq!(q.load().await.unwrap().tasks.len(), 1);
    }

    #[tokio::test]
    async fn load_or_recover_skips_bad_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        q.add_task(TaskType::Custom, 1, json!("x")).await.unwrap();
        q.backup("good").await.unwrap();

        let newer = dir.path().join("backups/queue-29990101T000000.000Z-bad.json");
        std::fs::write(&newer, b"garbage").unwrap();
        std::fs::write(q.store().queue_path(), b"garbage").unwrap();

        let doc = q.load_or_recover().await.unwrap();
        assert_eq!(doc.tasks.len(), 1);
    }

    #[tokio::test]
    async fn load_or_recover_without_snapshots_reports_no_backup() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        q.add_task(TaskType::Custom, 1, json!("x")).await.unwrap();
        std::fs::write(q.store().queue_path(), b"garbage").unwrap();

        let err = q.load_or_recover().await.unwrap_err();
        assert!(matches!(err, QueueError::NoBackup { .. }), "{err}");
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_finished_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        let done = q.add_task(TaskType::Custom, 1, json!("done")).await.unwrap();
        let waiting = q.add_task(TaskType::Custom, 2, json!("waiting")).await.unwrap();
        q.claim_next().await.unwrap();
        q.transition(&done, TaskStatus::Completed, "ok").await.unwrap();

        let mut doc = q.load().await.unwrap();
        let old = Utc::now() - chrono::Duration::days(40);
        for task in &mut doc.tasks {
            task.created_at = old;
            task.last_modified = old;
        }
        q.save(&doc).await.unwrap();

        assert_eq!(q.cleanup_old(30).await.unwrap(), 1);
        let remaining = q.list_tasks(None).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, waiting);
        assert_eq!(q.list_backups().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tracker_submissions_are_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        let tracker = TrackerRef {
            repo: Some("acme/app".into()),
            number: 17,
            url: None,
        };

        let (first, created) = q
            .add_tracker_task(TaskType::GithubIssue, tracker.clone(), 3, json!({"title": "Bug"}))
            .await
            .unwrap();
        assert!(created);
        let (second, created) = q
            .add_tracker_task(TaskType::GithubIssue, tracker.clone(), 3, json!({"title": "Bug"}))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(first, second);
        assert!(q.find_by_tracker(TaskType::GithubIssue, &tracker).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_in_progress_tasks_are_reset() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        let id = q.add_task(TaskType::Custom, 1, json!("x")).await.unwrap();
        q.claim_next().await.unwrap();

        let reset = q.reset_stale_in_progress("restart").await.unwrap();
        assert_eq!(reset, vec![id.clone()]);
        assert_eq!(q.get_task(&id).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn external_writes_between_operations_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let ours = queue(dir.path());
        let theirs = queue(dir.path());

        ours.add_task(TaskType::Custom, 1, json!("ours")).await.unwrap();
        theirs.add_task(TaskType::GithubIssue, 1, json!({"title": "theirs"})).await.unwrap();
        ours.add_task(TaskType::Custom, 1, json!("ours again")).await.unwrap();

        assert_eq!(ours.counts().await.unwrap().total, 3);
    }
}
