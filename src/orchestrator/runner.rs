//! The orchestration loop.
//!
//! Each cycle: check the session output for a usage limit, make sure the
//! project's session is healthy, run the next task, apply the context policy
//! and sleep. Queue state lives only in the task queue; the loop owns the
//! session registry and its own bookkeeping.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::AutopilotConfig;
use crate::error::{Error, QueueError, SessionError};
use crate::limits::{RecoveryScheduler, UsageLimitDetector, UsageLimitSignal, WaitOutcome};
use crate::orchestrator::monitor::{
    MonitorOutcome, OutputClassifier, TaskMonitor, TaskObservation, TaskPrompt, after_outcome,
    fingerprint, latest_response,
};
use crate::orchestrator::policy::{CLEAR_COMMAND, CompletionReason, ContextPolicy};
use crate::orchestrator::state::{LoopState, LoopStateTracker};
use crate::queue::engine::{AttemptOutcome, TaskQueue};
use crate::queue::model::{Task, TaskId, TaskStatus};
use crate::session::{
    ExecutionCollaborator, ProjectId, SessionCollaborator, SessionHandle, SessionRegistry,
    SessionState, project_id,
};

/// Marker file that pauses queue processing while present.
pub const PAUSE_FILE: &str = "paused";

/// First delay between transient-error retries; grows linearly.
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(500);

/// Loop tuning, taken from `AutopilotConfig`.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub cycle_interval: Duration,
    pub max_cycles: Option<u64>,
    pub poll_interval: Duration,
    pub task_inactivity_timeout: Duration,
    pub max_limit_preemptions: u32,
    pub max_session_restarts: u32,
    pub transient_retries: u32,
    pub backup_interval: Duration,
    pub backup_retention_days: u32,
    pub task_retention_days: u32,
    pub queue_enabled: bool,
    pub context_clear_default: bool,
    pub default_cooldown: Duration,
    pub scan_tail_lines: usize,
}

impl From<&AutopilotConfig> for OrchestratorSettings {
    fn from(config: &AutopilotConfig) -> Self {
        Self {
            cycle_interval: config.cycle_interval,
            max_cycles: config.max_cycles,
            poll_interval: config.poll_interval,
            task_inactivity_timeout: config.task_inactivity_timeout,
            max_limit_preemptions: config.max_limit_preemptions,
            max_session_restarts: config.max_session_restarts,
            transient_retries: config.transient_retries,
            backup_interval: config.backup_interval,
            backup_retention_days: config.backup_retention_days,
            task_retention_days: config.task_retention_days,
            queue_enabled: config.queue_enabled,
            context_clear_default: config.context_clear_default,
            default_cooldown: config.default_cooldown,
            scan_tail_lines: config.scan_tail_lines,
        }
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    MaxCycles,
    Interrupted,
    Failed(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxCycles => write!(f, "max_cycles"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Totals for one `run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub completed: u64,
    pub failed: u64,
    pub limit_waits: u64,
    pub stop_reason: StopReason,
}

impl Default for RunSummary {
    fn default() -> Self {
        Self {
            cycles: 0,
            completed: 0,
            failed: 0,
            limit_waits: 0,
            stop_reason: StopReason::Interrupted,
        }
    }
}

enum CycleEnd {
    Continue,
    Interrupted,
}

/// Queue write that closes out one attempt of a task.
///
/// Kept around when the write loses to lock contention so a later cycle can
/// replay it; until then the task stays `in_progress` and is never claimed
/// again.
#[derive(Debug, Clone)]
enum Settlement {
    Complete(TaskId),
    Fail {
        id: TaskId,
        message: String,
        code: &'static str,
        terminal: TaskStatus,
    },
    Preempt(TaskId),
    GiveUp { id: TaskId, message: String },
    Release(TaskId),
}

impl Settlement {
    fn task_id(&self) -> &TaskId {
        match self {
            Self::Complete(id) | Self::Preempt(id) | Self::Release(id) => id,
            Self::Fail { id, .. } | Self::GiveUp { id, .. } => id,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Complete(_) => "complete task",
            Self::Fail { .. } => "record failure",
            Self::Preempt(_) => "preempt task",
            Self::GiveUp { .. } => "abandon task",
            Self::Release(_) => "return interrupted task",
        }
    }
}

/// Drives one project's assistant through its queue.
pub struct Orchestrator {
    queue: TaskQueue,
    registry: SessionRegistry,
    execution: Arc<dyn ExecutionCollaborator>,
    sessions: Arc<dyn SessionCollaborator>,
    monitor: TaskMonitor,
    scheduler: RecoveryScheduler,
    policy: ContextPolicy,
    clock: Arc<dyn Clock>,
    settings: OrchestratorSettings,
    project_id: ProjectId,
    project_path: PathBuf,
    pause_file: PathBuf,
    state: LoopStateTracker,
    summary: RunSummary,
    /// Output snapshot whose limit message was already waited out.
    handled_limit: Option<u64>,
    /// Task updates that could not get the queue lock yet.
    deferred: Vec<Settlement>,
    last_maintenance: Option<DateTime<Utc>>,
}

impl Orchestrator {
    pub fn new(
        config: &AutopilotConfig,
        queue: TaskQueue,
        registry: SessionRegistry,
        execution: Arc<dyn ExecutionCollaborator>,
        sessions: Arc<dyn SessionCollaborator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let settings = OrchestratorSettings::from(config);
        let project_path = config.absolute_project_dir();
        let detector = UsageLimitDetector::new(settings.default_cooldown)
            .with_tail_lines(settings.scan_tail_lines);
        let monitor = TaskMonitor::new(
            OutputClassifier::new(detector),
            clock.clone(),
            settings.poll_interval,
            settings.task_inactivity_timeout,
        );

        Self {
            queue,
            registry,
            execution,
            sessions,
            monitor,
            scheduler: RecoveryScheduler::new(clock.clone()),
            policy: ContextPolicy::new(settings.context_clear_default),
            clock,
            project_id: project_id(&project_path),
            project_path,
            pause_file: config.state_dir().join(PAUSE_FILE),
            settings,
            state: LoopStateTracker::default(),
            summary: RunSummary::default(),
            handled_limit: None,
            deferred: Vec::new(),
            last_maintenance: None,
        }
    }

    /// Replace the recovery scheduler (custom steps or a progress observer).
    pub fn with_scheduler(mut self, scheduler: RecoveryScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    pub fn state(&self) -> LoopState {
        self.state.current()
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Run cycles until `max_cycles`, cancellation or an unrecoverable error.
    ///
    /// A summary is logged however the loop ends.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<RunSummary, Error> {
        self.summary = RunSummary::default();
        info!(
            project_id = %self.project_id,
            path = %self.project_path.display(),
            "Autopilot starting"
        );

        let result = self.run_inner(&cancel).await;
        self.replay_deferred().await;
        if !self.deferred.is_empty() {
            warn!(
                count = self.deferred.len(),
                "Task updates still pending; those tasks are requeued on next start"
            );
        }
        self.state.advance(LoopState::Stopped, self.clock.now());

        match &result {
            Ok(reason) => self.summary.stop_reason = reason.clone(),
            Err(e) => self.summary.stop_reason = StopReason::Failed(e.to_string()),
        }
        let summary = self.summary.clone();
        info!(
            cycles = summary.cycles,
            completed = summary.completed,
            failed = summary.failed,
            limit_waits = summary.limit_waits,
            stop_reason = %summary.stop_reason,
            "Autopilot stopped"
        );

        match result {
            Ok(_) => Ok(summary),
            Err(e) => {
                error!(error = %e, "Autopilot halted");
                Err(e)
            }
        }
    }

    async fn run_inner(&mut self, cancel: &CancellationToken) -> Result<StopReason, Error> {
        self.startup().await?;

        loop {
            if cancel.is_cancelled() {
                return Ok(StopReason::Interrupted);
            }

            self.summary.cycles += 1;
            let cycle = self.summary.cycles;

            match self.run_cycle(cancel).await {
                Ok(CycleEnd::Continue) => {}
                Ok(CycleEnd::Interrupted) => return Ok(StopReason::Interrupted),
                Err(e) => self.handle_cycle_error(cycle, e).await?,
            }

            if self.settings.max_cycles.is_some_and(|max| cycle >= max) {
                return Ok(StopReason::MaxCycles);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(StopReason::Interrupted),
                _ = tokio::time::sleep(self.settings.cycle_interval) => {}
            }
        }
    }

    /// Put tasks a crashed run left behind back in the queue.
    async fn startup(&mut self) -> Result<(), Error> {
        let reset = match self.queue.reset_stale_in_progress("reset on startup").await {
            Err(QueueError::CorruptState { .. }) => {
                self.queue.load_or_recover().await?;
                self.queue.reset_stale_in_progress("reset on startup").await?
            }
            other => other?,
        };
        if !reset.is_empty() {
            info!(count = reset.len(), "Requeued tasks interrupted by a previous run");
        }
        Ok(())
    }

    /// Abandoned cycles are logged; corruption is repaired from backups;
    /// anything else stops the loop.
    async fn handle_cycle_error(&mut self, cycle: u64, err: Error) -> Result<(), Error> {
        self.state.advance(LoopState::Idle, self.clock.now());
        match err {
            Error::Queue(e @ QueueError::CorruptState { .. }) => {
                warn!(cycle, error = %e, "Queue corrupt, recovering from backup");
                self.queue.load_or_recover().await?;
                info!(cycle, "Queue restored from backup");
                Ok(())
            }
            Error::Queue(e) if e.is_transient() => {
                warn!(cycle, error = %e, "Cycle abandoned after transient errors");
                Ok(())
            }
            other => Err(other),
        }
    }

    async fn run_cycle(&mut self, cancel: &CancellationToken) -> Result<CycleEnd, Error> {
        self.maintenance().await;
        self.replay_deferred().await;

        // 1. Usage limit visible in the session?
        self.state.advance(LoopState::CheckingLimits, self.clock.now());
        if let Some((signal, snapshot)) = self.observe_limit().await {
            self.state.advance(LoopState::UsageLimited, self.clock.now());
            self.mark_session(SessionState::UsageLimited).await;
            let end = self
                .wait_out_limit(signal, snapshot, "usage limit in session output", cancel)
                .await?;
            if matches!(end, CycleEnd::Continue) {
                self.state.advance(LoopState::Idle, self.clock.now());
            }
            return Ok(end);
        }

        // 2. Session health.
        self.state.advance(LoopState::CheckingSession, self.clock.now());
        let handle = match self.ensure_session().await? {
            SessionCheck::Healthy(handle) => handle,
            SessionCheck::Recovered => {
                self.state.advance(LoopState::Idle, self.clock.now());
                return Ok(CycleEnd::Continue);
            }
        };

        // 3. Queue.
        if !self.settings.queue_enabled || self.is_paused().await {
            info!("Queue processing disabled or paused, skipping");
            self.state.advance(LoopState::Idle, self.clock.now());
            return Ok(CycleEnd::Continue);
        }

        self.state.advance(LoopState::ProcessingQueue, self.clock.now());
        let queue = &self.queue;
        let claimed = retry_transient(self.settings.transient_retries, "claim_next", || {
            queue.claim_next()
        })
        .await?;
        let Some(task) = claimed else {
            info!("No pending tasks");
            self.state.advance(LoopState::Idle, self.clock.now());
            return Ok(CycleEnd::Continue);
        };

        self.state.advance(LoopState::TaskRunning, self.clock.now());
        let end = self.execute_task(&task, &handle, cancel).await?;
        if matches!(end, CycleEnd::Continue) {
            self.state.advance(LoopState::Idle, self.clock.now());
        }
        Ok(end)
    }

    /// Limit signal in the latest response, unless that exact output was
    /// already waited out.
    ///
    /// Only text after the last outcome marker counts: a finished reply that
    /// merely talks about rate limits or times of day is not a limit.
    async fn observe_limit(&self) -> Option<(UsageLimitSignal, u64)> {
        let handle = self.registry.find_by_project(&self.project_id)?;
        let output = match self.execution.recent_output(handle).await {
            Ok(output) => output,
            Err(e) => {
                warn!(
                    handle = %handle,
                    error = %e,
                    "Could not read session output for limit check"
                );
                return None;
            }
        };

        let snapshot = fingerprint(&output);
        if self.handled_limit == Some(snapshot) {
            return None;
        }
        let unsettled = after_outcome(latest_response(&output));
        let signal = self.monitor.classifier().detector().detect(unsettled);
        signal.is_limited().then_some((signal, snapshot))
    }

    async fn wait_out_limit(
        &mut self,
        signal: UsageLimitSignal,
        snapshot: u64,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<CycleEnd, Error> {
        let now_local = self.clock.now_local();
        let resume_at = signal
            .resume_at(&now_local)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|| self.clock.now());
        info!(%signal, resume_at = %resume_at, "Usage limit detected");

        self.state.advance(LoopState::Waiting, self.clock.now());
        self.summary.limit_waits += 1;
        match self.scheduler.wait_until(resume_at, reason, cancel).await {
            WaitOutcome::Cancelled => Ok(CycleEnd::Interrupted),
            WaitOutcome::Elapsed => {
                self.handled_limit = Some(snapshot);
                if self.registry.find_by_project(&self.project_id).is_some() {
                    if let Err(e) = self.registry.record_recovery(&self.project_id).await {
                        warn!(error = %e, "Could not record session recovery");
                    }
                }
                self.mark_session(SessionState::Running).await;
                Ok(CycleEnd::Continue)
            }
        }
    }

    async fn ensure_session(&mut self) -> Result<SessionCheck, Error> {
        let existing = self.registry.find_by_project(&self.project_id).cloned();

        let handle = match existing {
            Some(handle) => handle,
            None => match self.adopt_session().await? {
                Some(handle) => handle,
                None => {
                    let handle = self.start_session().await?;
                    return Ok(SessionCheck::Healthy(handle));
                }
            },
        };

        let healthy = match self.sessions.health_check(&handle).await {
            Ok(healthy) => healthy,
            Err(e) => {
                warn!(handle = %handle, error = %e, "Health check failed");
                false
            }
        };
        if healthy {
            self.registry.mark_healthy(&self.project_id).await?;
            return Ok(SessionCheck::Healthy(handle));
        }

        self.state.advance(LoopState::Unhealthy, self.clock.now());
        warn!(handle = %handle, "Assistant session unhealthy");
        self.state.advance(LoopState::Recovering, self.clock.now());
        self.mark_session(SessionState::Error).await;

        // Consecutive restarts only; a passed health check closes the episode.
        let restarts = self.registry.record_restart(&self.project_id).await?;
        if restarts > self.settings.max_session_restarts {
            return Err(SessionError::RecoveryExhausted {
                project_id: self.project_id.to_string(),
                attempts: restarts - 1,
            }
            .into());
        }
        self.start_session().await?;
        info!(restarts, "Assistant session restarted");
        Ok(SessionCheck::Recovered)
    }

    /// Take over a session for this project that is already running but
    /// not in the registry, e.g. after the registry was wiped.
    async fn adopt_session(&mut self) -> Result<Option<SessionHandle>, Error> {
        let handle = SessionHandle::for_project(&self.project_id);
        let exists = match self.sessions.session_exists(&handle).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(handle = %handle, error = %e, "Could not check for a running session");
                false
            }
        };
        if !exists {
            return Ok(None);
        }

        self.register_session(handle.clone()).await?;
        info!(handle = %handle, "Adopted running assistant session");
        Ok(Some(handle))
    }

    async fn start_session(&mut self) -> Result<SessionHandle, Error> {
        let handle = self
            .sessions
            .start_session(&self.project_id, &self.project_path)
            .await?;
        self.register_session(handle.clone()).await?;
        Ok(handle)
    }

    async fn register_session(&mut self, handle: SessionHandle) -> Result<(), Error> {
        let name = self
            .project_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.project_id.to_string());
        self.registry
            .register(handle, name, self.project_path.clone(), self.project_id.clone())
            .await?;
        self.registry
            .update_state(&self.project_id, SessionState::Running)
            .await?;
        self.handled_limit = None;
        Ok(())
    }

    /// Best-effort registry state update; failures only get logged.
    async fn mark_session(&mut self, state: SessionState) {
        if self.registry.find_by_project(&self.project_id).is_none() {
            return;
        }
        if let Err(e) = self.registry.update_state(&self.project_id, state).await {
            warn!(to = %state, error = %e, "Could not update session state");
        }
    }

    async fn is_paused(&self) -> bool {
        tokio::fs::try_exists(&self.pause_file).await.unwrap_or(false)
    }

    async fn execute_task(
        &mut self,
        task: &Task,
        handle: &SessionHandle,
        cancel: &CancellationToken,
    ) -> Result<CycleEnd, Error> {
        let prompt = TaskPrompt::for_task(task);
        info!(
            task_id = %task.id,
            priority = task.priority,
            retry_count = task.retry_count,
            "Running task"
        );

        if let Err(e) = self.execution.send(handle, &prompt.text).await {
            self.state.advance(LoopState::TaskFailed, self.clock.now());
            self.record_failure(task, &e.to_string(), "collaborator", TaskStatus::Failed)
                .await?;
            return Ok(CycleEnd::Continue);
        }

        let outcome = self
            .monitor
            .watch(self.execution.as_ref(), handle, &task.id, &prompt.tag, cancel)
            .await;

        let reason = match outcome {
            MonitorOutcome::Interrupted => {
                self.settle(Settlement::Release(task.id.clone())).await?;
                info!(task_id = %task.id, "Task returned to queue on shutdown");
                return Ok(CycleEnd::Interrupted);
            }
            MonitorOutcome::Finished {
                observation: TaskObservation::UsageLimited(signal),
                output,
            } => {
                self.state.advance(LoopState::TaskUsageLimited, self.clock.now());
                self.mark_session(SessionState::UsageLimited).await;
                self.preempt(task).await?;
                self.apply_policy(task, CompletionReason::LimitPreemption, handle).await;
                return self
                    .wait_out_limit(signal, fingerprint(&output), "usage limit during task", cancel)
                    .await;
            }
            MonitorOutcome::Finished {
                observation: TaskObservation::Completed,
                ..
            } => {
                self.state.advance(LoopState::TaskDone, self.clock.now());
                self.settle(Settlement::Complete(task.id.clone())).await?;
                CompletionReason::Normal
            }
            MonitorOutcome::Finished {
                observation: TaskObservation::Failed { reason },
                ..
            } => {
                self.state.advance(LoopState::TaskFailed, self.clock.now());
                self.record_failure(task, &reason, "task_failed", TaskStatus::Failed)
                    .await?;
                CompletionReason::Error
            }
            MonitorOutcome::Finished {
                observation: TaskObservation::Errored { message },
                ..
            } => {
                self.state.advance(LoopState::TaskFailed, self.clock.now());
                self.record_failure(task, &message, "assistant_error", TaskStatus::Failed)
                    .await?;
                CompletionReason::Error
            }
            MonitorOutcome::ReadFailed(e) => {
                self.state.advance(LoopState::TaskFailed, self.clock.now());
                self.record_failure(task, &e.to_string(), "collaborator", TaskStatus::Failed)
                    .await?;
                CompletionReason::Error
            }
            MonitorOutcome::Inactive { idle } => {
                self.state.advance(LoopState::TaskFailed, self.clock.now());
                let message = format!("no new output for {}s", idle.as_secs());
                self.record_failure(task, &message, "timeout", TaskStatus::Timeout)
                    .await?;
                CompletionReason::Timeout
            }
        };

        self.apply_policy(task, reason, handle).await;
        Ok(CycleEnd::Continue)
    }

    /// Return a limited task to the queue, or fail it once it has been
    /// preempted `max_limit_preemptions` times in a row.
    async fn preempt(&mut self, task: &Task) -> Result<(), Error> {
        let settlement = if task.limit_hits + 1 >= self.settings.max_limit_preemptions {
            Settlement::GiveUp {
                id: task.id.clone(),
                message: format!("usage limit hit {} consecutive times", task.limit_hits + 1),
            }
        } else {
            Settlement::Preempt(task.id.clone())
        };
        self.settle(settlement).await
    }

    async fn record_failure(
        &mut self,
        task: &Task,
        message: &str,
        code: &'static str,
        terminal: TaskStatus,
    ) -> Result<(), Error> {
        self.settle(Settlement::Fail {
            id: task.id.clone(),
            message: message.to_string(),
            code,
            terminal,
        })
        .await
    }

    /// Write a settlement, deferring it when the queue stays busy.
    async fn settle(&mut self, settlement: Settlement) -> Result<(), Error> {
        match self.apply_settlement(&settlement).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => {
                warn!(
                    task_id = %settlement.task_id(),
                    operation = settlement.label(),
                    error = %e,
                    "Queue busy, deferring task update"
                );
                self.deferred.push(settlement);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Retry settlements deferred by earlier cycles.
    async fn replay_deferred(&mut self) {
        for settlement in std::mem::take(&mut self.deferred) {
            match self.apply_settlement(&settlement).await {
                Ok(()) => info!(
                    task_id = %settlement.task_id(),
                    operation = settlement.label(),
                    "Deferred task update applied"
                ),
                Err(e) if e.is_transient() => self.deferred.push(settlement),
                Err(e) => warn!(
                    task_id = %settlement.task_id(),
                    operation = settlement.label(),
                    error = %e,
                    "Dropping deferred task update"
                ),
            }
        }
    }

    async fn apply_settlement(&mut self, settlement: &Settlement) -> Result<(), QueueError> {
        let queue = &self.queue;
        let retries = self.settings.transient_retries;
        let what = settlement.label();
        match settlement {
            Settlement::Complete(id) => {
                retry_transient(retries, what, || {
                    queue.transition(id, TaskStatus::Completed, "assistant reported completion")
                })
                .await?;
                self.summary.completed += 1;
            }
            Settlement::Fail {
                id,
                message,
                code,
                terminal,
            } => {
                let outcome = retry_transient(retries, what, || {
                    queue.fail_attempt(id, message.as_str(), Some(*code), *terminal)
                })
                .await?;
                if let AttemptOutcome::GaveUp { status } = outcome {
                    error!(task_id = %id, %status, error = %message, "Task out of retries");
                    self.summary.failed += 1;
                }
            }
            Settlement::Preempt(id) => {
                retry_transient(retries, what, || {
                    queue.preempt_for_limit(id, "usage limit reached")
                })
                .await?;
            }
            Settlement::GiveUp { id, message } => {
                retry_transient(retries, what, || {
                    queue.give_up(id, message.as_str(), Some("limit_exhausted"))
                })
                .await?;
                self.summary.failed += 1;
            }
            Settlement::Release(id) => {
                retry_transient(retries, what, || {
                    queue.transition(id, TaskStatus::Pending, "interrupted by shutdown")
                })
                .await?;
            }
        }
        Ok(())
    }

    async fn apply_policy(&self, task: &Task, reason: CompletionReason, handle: &SessionHandle) {
        if !self.policy.should_clear(task, reason) {
            info!(task_id = %task.id, %reason, "Keeping assistant context");
            return;
        }
        match self.execution.send(handle, CLEAR_COMMAND).await {
            Ok(()) => info!(task_id = %task.id, "Cleared assistant context"),
            Err(e) => warn!(task_id = %task.id, error = %e, "Failed to clear assistant context"),
        }
    }

    /// Scheduled snapshot plus retention sweeps. Failures are logged only.
    async fn maintenance(&mut self) {
        let now = self.clock.now();
        let interval = chrono::Duration::from_std(self.settings.backup_interval)
            .unwrap_or(chrono::Duration::hours(1));
        if self.last_maintenance.is_some_and(|last| now - last < interval) {
            return;
        }
        self.last_maintenance = Some(now);

        match self.queue.store().read().await {
            Ok(Some(_)) => {
                if let Err(e) = self.queue.backup("scheduled").await {
                    warn!(error = %e, "Scheduled backup failed");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Skipping scheduled backup"),
        }
        if let Err(e) = self.queue.prune_backups(self.settings.backup_retention_days).await {
            warn!(error = %e, "Backup pruning failed");
        }
        if let Err(e) = self.queue.cleanup_old(self.settings.task_retention_days).await {
            warn!(error = %e, "Task cleanup failed");
        }
    }
}

enum SessionCheck {
    Healthy(SessionHandle),
    Recovered,
}

/// Retry `op` while it fails transiently, up to `retries` extra attempts.
async fn retry_transient<T, F, Fut>(retries: u32, what: &str, mut op: F) -> Result<T, QueueError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, QueueError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < retries => {
                attempt += 1;
                warn!(operation = what, attempt, error = %e, "Transient queue error, retrying");
                tokio::time::sleep(TRANSIENT_BACKOFF * attempt).await;
            }
            other => return other,
        }
    }
}
