//! AI Autopilot: keeps an AI coding-assistant session working through a task
//! queue, pausing and resuming around usage limits.

pub mod clock;
pub mod config;
pub mod error;
pub mod limits;
pub mod orchestrator;
pub mod queue;
pub mod session;
