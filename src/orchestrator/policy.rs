//! Whether to reset the assistant's conversation after a task.

use std::fmt;

use crate::queue::model::Task;

/// Command sent to the assistant to clear its context.
pub const CLEAR_COMMAND: &str = "/clear";

/// Why a task stopped running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    Normal,
    LimitPreemption,
    Error,
    Timeout,
}

impl fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Normal => "normal",
            Self::LimitPreemption => "limit_preemption",
            Self::Error => "error",
            Self::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ContextPolicy {
    clear_by_default: bool,
}

impl ContextPolicy {
    pub fn new(clear_by_default: bool) -> Self {
        Self { clear_by_default }
    }

    /// Preempted, failed and timed-out tasks keep their context so the next
    /// attempt can pick up where it stopped. Otherwise the task's own
    /// preference wins over the default.
    pub fn should_clear(&self, task: &Task, reason: CompletionReason) -> bool {
        match reason {
            CompletionReason::LimitPreemption
            | CompletionReason::Error
            | CompletionReason::Timeout => false,
            CompletionReason::Normal => task.clear_context.unwrap_or(self.clear_by_default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::model::TaskType;
    use chrono::Utc;
    use serde_json::json;

    fn task() -> Task {
        Task::new(TaskType::Custom, 1, json!("do it"), Utc::now())
    }

    #[test]
    fn explicit_false_is_never_cleared() {
        let policy = ContextPolicy::new(true);
        let task = task().with_clear_context(false);
        assert!(!policy.should_clear(&task, CompletionReason::Normal));
    }

    #[test]
    fn explicit_true_overrides_default_off() {
        let policy = ContextPolicy::new(false);
        assert!(policy.should_clear(&task().with_clear_context(true), CompletionReason::Normal));
        assert!(!policy.should_clear(&task(), CompletionReason::Normal));
    }

    #[test]
    fn default_applies_without_preference() {
        assert!(ContextPolicy::new(true).should_clear(&task(), CompletionReason::Normal));
    }

    #[test]
    fn abnormal_endings_preserve_context() {
        let policy = ContextPolicy::new(true);
        let eager = task().with_clear_context(true);
        for reason in [
            CompletionReason::LimitPreemption,
            CompletionReason::Error,
            CompletionReason::Timeout,
        ] {
            assert!(!policy.should_clear(&eager, reason), "{reason}");
        }
    }
}
