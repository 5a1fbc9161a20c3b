//! Orchestration loop: ties queue, session health and limit handling together.

pub mod monitor;
pub mod policy;
pub mod runner;
pub mod state;

pub use monitor::{OutputClassifier, TaskMonitor, TaskObservation, TaskPrompt};
pub use policy::{CompletionReason, ContextPolicy};
pub use runner::{Orchestrator, OrchestratorSettings, PAUSE_FILE, RunSummary, StopReason};
pub use state::{LoopState, LoopStateTracker};
