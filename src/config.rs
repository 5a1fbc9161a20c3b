//! Configuration types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Directory inside a project that holds the queue, its lock and backups.
pub const STATE_DIR_NAME: &str = ".autopilot";

/// Autopilot configuration.
#[derive(Debug, Clone)]
pub struct AutopilotConfig {
    /// Project working directory (determines queue and session identity).
    pub project_dir: PathBuf,
    /// Where session records are persisted (shared across projects).
    pub sessions_dir: PathBuf,
    /// Retries allowed per task before it is marked failed.
    pub max_retries: u32,
    /// Wait applied when a limit phrase is seen without an explicit time.
    pub default_cooldown: Duration,
    /// How long a queue mutation may wait for the project lock.
    pub lock_timeout: Duration,
    /// Age after which backup snapshots are deleted.
    pub backup_retention_days: u32,
    /// Age after which completed/failed tasks are removed.
    pub task_retention_days: u32,
    /// Clear the assistant context between tasks unless a task says otherwise.
    pub context_clear_default: bool,
    /// Upper bound on in-memory session records.
    pub max_tracked_sessions: usize,
    /// Sleep between orchestration cycles.
    pub cycle_interval: Duration,
    /// Stop after this many cycles (`None` = run until interrupted).
    pub max_cycles: Option<u64>,
    /// Poll interval while a task is running.
    pub poll_interval: Duration,
    /// Unchanged output for this long fails the running task.
    pub task_inactivity_timeout: Duration,
    /// Consecutive limit preemptions of one task before giving up on it.
    pub max_limit_preemptions: u32,
    /// Session restart attempts per unhealthy episode.
    pub max_session_restarts: u32,
    /// Retries of a transient queue error within one cycle.
    pub transient_retries: u32,
    /// Interval between routine queue snapshots.
    pub backup_interval: Duration,
    /// Process queued tasks (when false only the session is babysat).
    pub queue_enabled: bool,
    /// Command launched inside a fresh assistant session.
    pub assistant_command: String,
    /// Trailing lines of session output inspected for limit messages.
    pub scan_tail_lines: usize,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            sessions_dir: default_sessions_dir(),
            max_retries: 3,
            default_cooldown: Duration::from_secs(3600), // 1 hour
            lock_timeout: Duration::from_secs(10),
            backup_retention_days: 7,
            task_retention_days: 30,
            context_clear_default: true,
            max_tracked_sessions: 32,
            cycle_interval: Duration::from_secs(30),
            max_cycles: None,
            poll_interval: Duration::from_secs(5),
            task_inactivity_timeout: Duration::from_secs(1800), // 30 minutes
            max_limit_preemptions: 5,
            max_session_restarts: 3,
            transient_retries: 3,
            backup_interval: Duration::from_secs(3600),
            queue_enabled: true,
            assistant_command: "claude".to_string(),
            scan_tail_lines: 40,
        }
    }
}

impl AutopilotConfig {
    /// Config for a project directory with every other value defaulted.
    pub fn for_project(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            ..Self::default()
        }
    }

    /// Build config from `AUTOPILOT_*` environment variables.
    ///
    /// Unset or unparseable values fall back to the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let project_dir = match std::env::var("AUTOPILOT_PROJECT_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => std::env::current_dir()?,
        };

        let sessions_dir = std::env::var("AUTOPILOT_SESSIONS_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.sessions_dir);

        let config = Self {
            project_dir,
            sessions_dir,
            max_retries: env_parse("AUTOPILOT_MAX_RETRIES").unwrap_or(defaults.max_retries),
            default_cooldown: env_secs("AUTOPILOT_DEFAULT_COOLDOWN_SECS")
                .unwrap_or(defaults.default_cooldown),
            lock_timeout: env_secs("AUTOPILOT_LOCK_TIMEOUT_SECS").unwrap_or(defaults.lock_timeout),
            backup_retention_days: env_parse("AUTOPILOT_BACKUP_RETENTION_DAYS")
                .unwrap_or(defaults.backup_retention_days),
            task_retention_days: env_parse("AUTOPILOT_TASK_RETENTION_DAYS")
                .unwrap_or(defaults.task_retention_days),
            context_clear_default: env_bool("AUTOPILOT_CONTEXT_CLEAR_DEFAULT")
                .unwrap_or(defaults.context_clear_default),
            max_tracked_sessions: env_parse("AUTOPILOT_MAX_TRACKED_SESSIONS")
                .unwrap_or(defaults.max_tracked_sessions),
            cycle_interval: env_secs("AUTOPILOT_CYCLE_INTERVAL_SECS")
                .unwrap_or(defaults.cycle_interval),
            max_cycles: env_parse("AUTOPILOT_MAX_CYCLES").or(defaults.max_cycles),
            poll_interval: env_secs("AUTOPILOT_POLL_INTERVAL_SECS")
                .unwrap_or(defaults.poll_interval),
            task_inactivity_timeout: env_secs("AUTOPILOT_TASK_TIMEOUT_SECS")
                .unwrap_or(defaults.task_inactivity_timeout),
            max_limit_preemptions: env_parse("AUTOPILOT_MAX_LIMIT_PREEMPTIONS")
                .unwrap_or(defaults.max_limit_preemptions),
            max_session_restarts: env_parse("AUTOPILOT_MAX_SESSION_RESTARTS")
                .unwrap_or(defaults.max_session_restarts),
            transient_retries: env_parse("AUTOPILOT_TRANSIENT_RETRIES")
                .unwrap_or(defaults.transient_retries),
            backup_interval: env_secs("AUTOPILOT_BACKUP_INTERVAL_SECS")
                .unwrap_or(defaults.backup_interval),
            queue_enabled: env_bool("AUTOPILOT_QUEUE_ENABLED").unwrap_or(defaults.queue_enabled),
            assistant_command: std::env::var("AUTOPILOT_ASSISTANT_CMD")
                .unwrap_or(defaults.assistant_command),
            scan_tail_lines: env_parse("AUTOPILOT_SCAN_TAIL_LINES")
                .unwrap_or(defaults.scan_tail_lines),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the orchestrator cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_timeout.is_zero() {
            return Err(invalid("lock_timeout", "must be greater than zero"));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid("poll_interval", "must be greater than zero"));
        }
        if self.max_tracked_sessions == 0 {
            return Err(invalid("max_tracked_sessions", "must be at least 1"));
        }
        if self.scan_tail_lines == 0 {
            return Err(invalid("scan_tail_lines", "must be at least 1"));
        }
        if self.assistant_command.trim().is_empty() {
            return Err(invalid("assistant_command", "must not be empty"));
        }
        Ok(())
    }

    /// `<project>/.autopilot`
    pub fn state_dir(&self) -> PathBuf {
        self.project_dir.join(STATE_DIR_NAME)
    }

    /// Absolute project path, falling back to the configured path as-is.
    pub fn absolute_project_dir(&self) -> PathBuf {
        absolutize(&self.project_dir)
    }
}

fn default_sessions_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".ai-autopilot/sessions")
}

fn absolutize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        }
    })
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

fn env_bool(key: &str) -> Option<bool> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AutopilotConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.context_clear_default);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn state_dir_lives_in_project() {
        let config = AutopilotConfig::for_project("/work/repo");
        assert_eq!(config.state_dir(), PathBuf::from("/work/repo/.autopilot"));
    }

    #[test]
    fn zero_lock_timeout_rejected() {
        let config = AutopilotConfig {
            lock_timeout: Duration::ZERO,
            ..AutopilotConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("lock_timeout"));
    }
}
