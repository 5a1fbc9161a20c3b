//! tmux-backed assistant sessions.
//!
//! Each project gets a detached tmux session running the assistant command
//! in the project directory. Input goes through a named paste buffer so
//! multi-line prompts arrive as one message.

use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::CollaboratorError;
use crate::session::collaborator::{ExecutionCollaborator, SessionCollaborator};
use crate::session::registry::{ProjectId, SessionHandle};

const PASTE_BUFFER: &str = "autopilot-input";

/// Talks to tmux through its CLI.
#[derive(Debug, Clone)]
pub struct TmuxSession {
    binary: String,
    assistant_command: String,
    capture_lines: usize,
    command_timeout: Duration,
}

impl TmuxSession {
    pub fn new(assistant_command: impl Into<String>) -> Self {
        Self {
            binary: "tmux".to_string(),
            assistant_command: assistant_command.into(),
            capture_lines: 200,
            command_timeout: Duration::from_secs(10),
        }
    }

    /// Use a different tmux executable.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Scrollback lines returned by `recent_output`.
    pub fn with_capture_lines(mut self, lines: usize) -> Self {
        self.capture_lines = lines.max(1);
        self
    }

    async fn run(&self, args: &[&str]) -> Result<Output, CollaboratorError> {
        let command_line = format!("{} {}", self.binary, args.join(" "));
        debug!(command = %command_line, "Running tmux");

        let child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.command_timeout, child).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(CollaboratorError::Command {
                command: command_line,
                reason: e.to_string(),
            }),
            Err(_) => Err(CollaboratorError::Command {
                command: command_line,
                reason: format!("timed out after {:?}", self.command_timeout),
            }),
        }
    }

    /// Run and require a zero exit status.
    async fn run_checked(&self, args: &[&str]) -> Result<Output, CollaboratorError> {
        let output = self.run(args).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(CollaboratorError::Command {
                command: format!("{} {}", self.binary, args.join(" ")),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl ExecutionCollaborator for TmuxSession {
    async fn send(&self, handle: &SessionHandle, text: &str) -> Result<(), CollaboratorError> {
        let target = handle.as_str();
        let send_failed = |e: CollaboratorError| CollaboratorError::SendFailed {
            handle: target.to_string(),
            reason: e.to_string(),
        };

        self.run_checked(&["set-buffer", "-b", PASTE_BUFFER, "--", text])
            .await
            .map_err(send_failed)?;
        self.run_checked(&["paste-buffer", "-d", "-b", PASTE_BUFFER, "-t", target])
            .await
            .map_err(send_failed)?;
        self.run_checked(&["send-keys", "-t", target, "Enter"])
            .await
            .map_err(send_failed)?;
        Ok(())
    }

    async fn recent_output(&self, handle: &SessionHandle) -> Result<String, CollaboratorError> {
        let start = format!("-{}", self.capture_lines);
        let output = self
            .run_checked(&["capture-pane", "-p", "-J", "-t", handle.as_str(), "-S", &start])
            .await
            .map_err(|e| CollaboratorError::ReadFailed {
                handle: handle.to_string(),
                reason: e.to_string(),
            })?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl SessionCollaborator for TmuxSession {
    async fn session_exists(&self, handle: &SessionHandle) -> Result<bool, CollaboratorError> {
        let exact = format!("={}", handle.as_str());
        let output = self.run(&["has-session", "-t", &exact]).await?;
        Ok(output.status.success())
    }

    async fn start_session(
        &self,
        project: &ProjectId,
        path: &Path,
    ) -> Result<SessionHandle, CollaboratorError> {
        let handle = SessionHandle::for_project(project);
        let dir = path.to_string_lossy();

        // A dead or wedged session keeps its name until killed.
        if self.session_exists(&handle).await? {
            let exact = format!("={}", handle.as_str());
            self.run_checked(&["kill-session", "-t", &exact])
                .await
                .map_err(|e| CollaboratorError::StartFailed {
                    project: project.to_string(),
                    reason: e.to_string(),
                })?;
            info!(handle = %handle, "Killed leftover assistant session");
        }

        self.run_checked(&[
            "new-session",
            "-d",
            "-s",
            handle.as_str(),
            "-c",
            &dir,
            &self.assistant_command,
        ])
        .await
        .map_err(|e| CollaboratorError::StartFailed {
            project: project.to_string(),
            reason: e.to_string(),
        })?;

        info!(
            project_id = %project,
            handle = %handle,
            path = %path.display(),
            "Started assistant session"
        );
        Ok(handle)
    }

    async fn health_check(&self, handle: &SessionHandle) -> Result<bool, CollaboratorError> {
        if !self.session_exists(handle).await? {
            return Ok(false);
        }
        let output = self
            .run(&["display-message", "-p", "-t", handle.as_str(), "#{pane_dead}"])
            .await?;
        if !output.status.success() {
            warn!(handle = %handle, "Could not query pane state");
            return Ok(false);
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim() == "0")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> SessionHandle {
        SessionHandle::parse("autopilot-test").unwrap()
    }

    #[tokio::test]
    async fn missing_binary_is_command_error() {
        let tmux = TmuxSession::new("claude").with_binary("/nonexistent/tmux-binary");
        let err = tmux.session_exists(&handle()).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Command { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_status_maps_to_existence() {
        let present = TmuxSession::new("claude").with_binary("true");
        assert!(present.session_exists(&handle()).await.unwrap());

        let absent = TmuxSession::new("claude").with_binary("false");
        assert!(!absent.session_exists(&handle()).await.unwrap());
        assert!(!absent.health_check(&handle()).await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_send_reports_handle() {
        let tmux = TmuxSession::new("claude").with_binary("false");
        let err = tmux.send(&handle(), "hello").await.unwrap_err();
        match err {
            CollaboratorError::SendFailed { handle, .. } => assert_eq!(handle, "autopilot-test"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_goes_through_leftover_session() {
        let project = ProjectId::parse("test").unwrap();
        let tmux = TmuxSession::new("claude").with_binary("true");
        let started = tmux.start_session(&project, Path::new("/tmp")).await.unwrap();
        assert_eq!(started, SessionHandle::for_project(&project));

        let broken = TmuxSession::new("claude").with_binary("false");
        let err = broken.start_session(&project, Path::new("/tmp")).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::StartFailed { .. }));
    }
}
