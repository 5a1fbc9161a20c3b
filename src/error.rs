//! Error types for AI Autopilot.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for the autopilot.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Could not determine project directory: {0}")]
    ProjectDir(#[from] std::io::Error),
}

/// Task queue errors.
///
/// `LockTimeout` and `Io` are transient; the caller retries the whole
/// operation. `CorruptState` signals backup recovery.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Task {id} cannot transition from {from} to {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("Task {id} not found")]
    NotFound { id: String },

    #[error("Timed out after {timeout:?} waiting for queue lock {path}")]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("Queue document {path} is corrupt: {reason}")]
    CorruptState { path: PathBuf, reason: String },

    #[error("No usable backup snapshot in {dir}")]
    NoBackup { dir: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::Io(_))
    }
}

/// Session registry errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid identifier {value:?}: {reason}")]
    InvalidIdentifier { value: String, reason: String },

    #[error("Session {handle} cannot transition from {from} to {to}")]
    InvalidTransition {
        handle: String,
        from: String,
        to: String,
    },

    #[error("No session registered for project {0}")]
    NotRegistered(String),

    #[error("Session recovery gave up after {attempts} attempts for project {project_id}")]
    RecoveryExhausted { project_id: String, attempts: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures reported by the execution and session collaborators.
///
/// Classified as task failures and subject to the retry policy.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("Failed to send input to session {handle}: {reason}")]
    SendFailed { handle: String, reason: String },

    #[error("Failed to read output of session {handle}: {reason}")]
    ReadFailed { handle: String, reason: String },

    #[error("Failed to start session for {project}: {reason}")]
    StartFailed { project: String, reason: String },

    #[error("Command {command} failed: {reason}")]
    Command { command: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the autopilot.
pub type Result<T> = std::result::Result<T, Error>;
