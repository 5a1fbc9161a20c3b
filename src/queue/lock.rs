//! Project lock: exclusive advisory lock around queue read-modify-write.
//!
//! Backed by `flock(2)` through `fs2`, so the kernel drops the lock when the
//! holder exits or crashes. Separate opens of the lock file conflict even
//! within one process, which lets tests exercise contention in-process.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::QueueError;

/// First retry delay while the lock is contended.
const BASE_BACKOFF_MS: u64 = 20;
/// Retry delay ceiling.
const MAX_BACKOFF_MS: u64 = 500;

/// Named lock for one project's queue.
#[derive(Debug, Clone)]
pub struct ProjectLock {
    path: PathBuf,
}

/// Held lock; released on drop, including on early return or error.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl ProjectLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the lock, polling until `timeout` elapses.
    pub async fn acquire(&self, timeout: Duration) -> Result<LockGuard, QueueError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let deadline = Instant::now() + timeout;
        let mut attempt: u32 = 0;

        loop {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&self.path)?;

            match file.try_lock_exclusive() {
                Ok(()) => {
                    let mut guard = LockGuard {
                        file,
                        path: self.path.clone(),
                    };
                    guard.write_owner();
                    if attempt > 0 {
                        debug!(
                            path = %self.path.display(),
                            attempt,
                            "Queue lock acquired after contention"
                        );
                    }
                    return Ok(guard);
                }
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {}
                Err(e) => return Err(QueueError::Io(e)),
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(path = %self.path.display(), ?timeout, "Timed out waiting for queue lock");
                return Err(QueueError::LockTimeout {
                    path: self.path.clone(),
                    timeout,
                });
            }

            let base = BASE_BACKOFF_MS.saturating_mul(1u64 << attempt.min(5)).min(MAX_BACKOFF_MS);
            let jitter = rand::thread_rng().gen_range(0..=base / 2);
            let delay = Duration::from_millis(base + jitter).min(deadline - now);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Run `op` while holding the lock.
    pub async fn with_lock<T, F, Fut>(&self, timeout: Duration, op: F) -> Result<T, QueueError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, QueueError>>,
    {
        let _guard = self.acquire(timeout).await?;
        op().await
    }
}

impl LockGuard {
    /// Record pid and time for whoever inspects a contended lock.
    fn write_owner(&mut self) {
        let owner = format!(
            "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
            std::process::id(),
            chrono::Utc::now().to_rfc3339()
        );
        let written = self
            .file
            .set_len(0)
            .and_then(|_| self.file.write_all(owner.as_bytes()));
        if let Err(e) = written {
            debug!(path = %self.path.display(), error = %e, "Could not write lock owner metadata");
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "Failed to release queue lock");
        }
    }
}
