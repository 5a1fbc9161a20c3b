//! Task queue: durable, lock-guarded per-project backlog.
//!
//! Core components:
//! - `model`: Task, statuses and the persisted QueueDocument
//! - `store`: atomic document writes and backup snapshots
//! - `lock`: exclusive advisory lock around every read-modify-write
//! - `engine`: TaskQueue operations (add, claim, transition, retry, backup)

pub mod engine;
pub mod lock;
pub mod model;
pub mod store;

pub use engine::{AttemptOutcome, QueueSettings, TaskQueue};
pub use lock::{LockGuard, ProjectLock};
pub use model::{QueueCounts, QueueDocument, Task, TaskId, TaskStatus, TaskType, TrackerRef};
pub use store::QueueStore;
