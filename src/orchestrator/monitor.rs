//! Watching a running task through the session's output.
//!
//! A task prompt ends with a tag line unique to the attempt. Everything the
//! session printed after the last tag line is the assistant's response, so
//! earlier tasks and the echoed prompt never influence classification.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::CollaboratorError;
use crate::limits::{UsageLimitDetector, UsageLimitSignal};
use crate::queue::model::{Task, TaskId};
use crate::session::{ExecutionCollaborator, SessionHandle};

/// Prefix of the line closing every task prompt.
pub const TAG_PREFIX: &str = "[autopilot task ";

/// Consecutive output read failures tolerated before giving up on a task.
const MAX_READ_FAILURES: u32 = 3;

static GENERIC_ERROR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)API Error|^\s*Error:|panicked at").unwrap());

static OUTCOME_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^.*TASK (?:COMPLETE|FAILED)[ \t]+\S.*$").unwrap());

/// A settled reading of the response. Still-working output has none.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskObservation {
    Completed,
    /// The assistant reported `TASK FAILED`.
    Failed { reason: String },
    /// Output shows a generic error.
    Errored { message: String },
    UsageLimited(UsageLimitSignal),
}

/// How watching a task ended.
#[derive(Debug)]
pub enum MonitorOutcome {
    /// A final observation plus the raw output it came from.
    Finished {
        observation: TaskObservation,
        output: String,
    },
    /// No new output for the inactivity timeout.
    Inactive { idle: Duration },
    Interrupted,
    ReadFailed(CollaboratorError),
}

/// One attempt's prompt, tagged so its response can be located.
#[derive(Debug, Clone)]
pub struct TaskPrompt {
    pub tag: String,
    pub text: String,
}

impl TaskPrompt {
    pub fn for_task(task: &Task) -> Self {
        let attempt = Uuid::new_v4().simple().to_string();
        let tag = format!("{TAG_PREFIX}{} attempt {}]", task.id, &attempt[..8]);
        let text = format!(
            "{prompt}\n\n\
             When the task is finished, print a line with the words TASK COMPLETE followed by the task id {id}.\n\
             If it cannot be finished, print TASK FAILED followed by the task id, a colon and the reason.\n\
             {tag}",
            prompt = task.prompt().trim_end(),
            id = task.id,
        );
        Self { tag, text }
    }
}

/// Text printed after the last line containing `tag`, or all of `output`
/// when the tag has scrolled away.
pub fn response_region<'a>(output: &'a str, tag: &str) -> &'a str {
    match output.rfind(tag) {
        Some(idx) => after_line(output, idx),
        None => output,
    }
}

/// Text after the most recent task prompt of any task.
pub fn latest_response(output: &str) -> &str {
    response_region(output, TAG_PREFIX)
}

fn after_line(output: &str, idx: usize) -> &str {
    match output[idx..].find('\n') {
        Some(nl) => &output[idx + nl + 1..],
        None => "",
    }
}

/// Text printed after the last `TASK COMPLETE`/`TASK FAILED` line, or all
/// of `response` when it reports no outcome. A finished reply is history.
pub fn after_outcome(response: &str) -> &str {
    match OUTCOME_MARKER.find_iter(response).last() {
        Some(m) => response[m.end()..].trim_start_matches(['\r', '\n']),
        None => response,
    }
}

/// Change-detection fingerprint of a piece of output.
pub fn fingerprint(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

/// Turns response text into a `TaskObservation`.
#[derive(Debug, Clone)]
pub struct OutputClassifier {
    detector: UsageLimitDetector,
}

impl OutputClassifier {
    pub fn new(detector: UsageLimitDetector) -> Self {
        Self { detector }
    }

    pub fn detector(&self) -> &UsageLimitDetector {
        &self.detector
    }

    /// Precedence: completion marker, usage limit, failure marker, generic
    /// error. A limit outranks any error. `None` while the task is working.
    pub fn classify(&self, response: &str, task_id: &TaskId) -> Option<TaskObservation> {
        let id = regex::escape(task_id.as_str());

        let complete = Regex::new(&format!(r"(?m)TASK COMPLETE\s+{id}(?:[^A-Za-z0-9_.\-]|$)"));
        if let Ok(complete) = complete {
            if complete.is_match(response) {
                return Some(TaskObservation::Completed);
            }
        }

        let signal = self.detector.detect(response);
        if signal.is_limited() {
            return Some(TaskObservation::UsageLimited(signal));
        }

        if let Ok(failed) = Regex::new(&format!(
            r"(?m)TASK FAILED\s+{id}(?::[ \t]*([^\r\n]*)|[ \t]+([^\r\n]*)|[ \t]*\r?$)"
        )) {
            if let Some(caps) = failed.captures(response) {
                let reason = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .map(|m| m.as_str().trim().to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "assistant reported failure".to_string());
                return Some(TaskObservation::Failed { reason });
            }
        }

        if let Some(m) = GENERIC_ERROR.find(response) {
            let line_start = response[..m.start()].rfind('\n').map_or(0, |i| i + 1);
            let line_end = response[m.start()..]
                .find('\n')
                .map_or(response.len(), |i| m.start() + i);
            return Some(TaskObservation::Errored {
                message: response[line_start..line_end].trim().to_string(),
            });
        }

        None
    }
}

/// Polls a session until the task's response settles on an outcome.
pub struct TaskMonitor {
    classifier: OutputClassifier,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    inactivity_timeout: Duration,
}

impl TaskMonitor {
    pub fn new(
        classifier: OutputClassifier,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
        inactivity_timeout: Duration,
    ) -> Self {
        Self {
            classifier,
            clock,
            poll_interval,
            inactivity_timeout,
        }
    }

    pub fn classifier(&self) -> &OutputClassifier {
        &self.classifier
    }

    pub async fn watch(
        &self,
        execution: &dyn ExecutionCollaborator,
        handle: &SessionHandle,
        task_id: &TaskId,
        tag: &str,
        cancel: &CancellationToken,
    ) -> MonitorOutcome {
        let mut last_fingerprint: Option<u64> = None;
        let mut last_change: DateTime<Utc> = self.clock.now();
        let mut read_failures = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return MonitorOutcome::Interrupted,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            let output = match execution.recent_output(handle).await {
                Ok(output) => {
                    read_failures = 0;
                    output
                }
                Err(e) => {
                    read_failures += 1;
                    warn!(
                        task_id = %task_id,
                        attempt = read_failures,
                        error = %e,
                        "Could not read session output"
                    );
                    if read_failures >= MAX_READ_FAILURES {
                        return MonitorOutcome::ReadFailed(e);
                    }
                    continue;
                }
            };

            let response = response_region(&output, tag);
            if let Some(observation) = self.classifier.classify(response, task_id) {
                debug!(task_id = %task_id, ?observation, "Task output settled");
                return MonitorOutcome::Finished { observation, output };
            }

            let now = self.clock.now();
            let current = fingerprint(response);
            if last_fingerprint != Some(current) {
                last_fingerprint = Some(current);
                last_change = now;
                continue;
            }

            let idle = (now - last_change).to_std().unwrap_or(Duration::ZERO);
            if idle >= self.inactivity_timeout {
                return MonitorOutcome::Inactive { idle };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::model::TaskType;
    use serde_json::json;

    fn classifier() -> OutputClassifier {
        OutputClassifier::new(UsageLimitDetector::new(Duration::from_secs(600)))
    }

    fn id() -> TaskId {
        TaskId::parse("custom-abc123").unwrap()
    }

    #[test]
    fn prompt_echo_is_not_a_completion() {
        let task = Task::new(TaskType::Custom, 1, json!("Fix the build"), Utc::now());
        let prompt = TaskPrompt::for_task(&task);
        assert!(prompt.text.ends_with(&prompt.tag));
        assert_eq!(classifier().classify(&prompt.text, &task.id), None);
    }

    #[test]
    fn response_region_starts_after_tag_line() {
        let output = concat!(
            "old TASK COMPLETE custom-abc123\n",
            "[autopilot task custom-abc123 attempt 1]\n",
            "working...\n",
        );
        let region = response_region(output, "[autopilot task custom-abc123 attempt 1]");
        assert_eq!(region, "working...\n");
        assert_eq!(classifier().classify(region, &id()), None);
    }

    #[test]
    fn completion_marker_matches_exact_id() {
        assert_eq!(
            classifier().classify("done.\nTASK COMPLETE custom-abc123\n", &id()),
            Some(TaskObservation::Completed)
        );
        assert_eq!(classifier().classify("TASK COMPLETE custom-abc1234", &id()), None);
    }

    #[test]
    fn failure_marker_carries_reason() {
        let obs = classifier().classify("TASK FAILED custom-abc123: tests still red", &id());
        assert_eq!(
            obs,
            Some(TaskObservation::Failed {
                reason: "tests still red".into()
            })
        );
        let obs = classifier().classify("TASK FAILED custom-abc123\n", &id());
        assert!(matches!(obs, Some(TaskObservation::Failed { .. })));
    }

    #[test]
    fn limit_wins_over_error() {
        let obs = classifier().classify("API Error: 429 rate limit exceeded", &id());
        assert_eq!(
            obs,
            Some(TaskObservation::UsageLimited(UsageLimitSignal::RelativeWait { seconds: 600 }))
        );
    }

    #[test]
    fn generic_error_line_is_reported() {
        let obs = classifier().classify("thinking\nError: connection reset by peer\n> ", &id());
        assert_eq!(
            obs,
            Some(TaskObservation::Errored {
                message: "Error: connection reset by peer".into()
            })
        );
    }

    #[test]
    fn finished_reply_is_not_rescanned() {
        let reply = "Scheduled the job for 9am, added backoff for rate limit errors.\n\
                     TASK COMPLETE custom-abc123\n";
        assert_eq!(after_outcome(reply), "");
        assert_eq!(
            after_outcome("TASK FAILED custom-abc123: flaky\nUsage limit reached.\n"),
            "Usage limit reached.\n"
        );
        assert_eq!(after_outcome("still thinking"), "still thinking");
    }

    #[test]
    fn latest_response_uses_last_prompt() {
        let output = concat!(
            "[autopilot task a attempt 1]\nrate limit\n",
            "[autopilot task b attempt 2]\nall fine\n",
        );
        assert_eq!(latest_response(output), "all fine\n");
    }
}
