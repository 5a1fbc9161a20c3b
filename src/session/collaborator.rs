//! Seams to the process actually running the assistant.
//!
//! The orchestrator only talks to the assistant through these traits. The
//! tmux adapter implements both; tests substitute scripted fakes.

use std::path::Path;

use async_trait::async_trait;

use crate::error::CollaboratorError;
use crate::session::registry::{ProjectId, SessionHandle};

/// Drives a live assistant session. Pure I/O, no scheduling.
#[async_trait]
pub trait ExecutionCollaborator: Send + Sync {
    /// Type `text` into the session and submit it.
    async fn send(&self, handle: &SessionHandle, text: &str) -> Result<(), CollaboratorError>;

    /// Currently visible output of the session, oldest line first.
    async fn recent_output(&self, handle: &SessionHandle) -> Result<String, CollaboratorError>;
}

/// Starts sessions and reports whether they are usable.
#[async_trait]
pub trait SessionCollaborator: Send + Sync {
    async fn session_exists(&self, handle: &SessionHandle) -> Result<bool, CollaboratorError>;

    /// Launch a session for the project and return its handle.
    async fn start_session(
        &self,
        project: &ProjectId,
        path: &Path,
    ) -> Result<SessionHandle, CollaboratorError>;

    /// Whether the session is alive and responsive.
    async fn health_check(&self, handle: &SessionHandle) -> Result<bool, CollaboratorError>;
}
