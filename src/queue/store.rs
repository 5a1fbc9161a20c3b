//! Queue persistence: the live document, atomic rewrites and snapshots.
//!
//! Layout under the project state directory:
//! - `queue.json`: live document
//! - `queue.lock`: project lock file
//! - `backups/queue-<UTC timestamp>-<label>.json`: snapshots, sortable by name

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::QueueError;
use crate::queue::model::QueueDocument;

pub const QUEUE_FILE: &str = "queue.json";
pub const LOCK_FILE: &str = "queue.lock";
pub const BACKUP_DIR: &str = "backups";

const BACKUP_PREFIX: &str = "queue-";
const BACKUP_TS_FORMAT: &str = "%Y%m%dT%H%M%S%.3f";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// File-backed storage for one project's queue.
#[derive(Debug, Clone)]
pub struct QueueStore {
    state_dir: PathBuf,
}

impl QueueStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn queue_path(&self) -> PathBuf {
        self.state_dir.join(QUEUE_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join(LOCK_FILE)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.state_dir.join(BACKUP_DIR)
    }

    /// Read the live document. `Ok(None)` when no queue exists yet.
    pub async fn read(&self) -> Result<Option<QueueDocument>, QueueError> {
        let path = self.queue_path();
        match fs::read(&path).await {
            Ok(bytes) => parse_document(&path, &bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the live document atomically (temp file + fsync + rename).
    pub async fn write(&self, doc: &QueueDocument) -> Result<(), QueueError> {
        let json = serde_json::to_vec_pretty(doc)?;
        atomic_write(&self.queue_path(), &json).await?;
        Ok(())
    }

    /// Parse a snapshot file.
    pub async fn read_snapshot(&self, path: &Path) -> Result<QueueDocument, QueueError> {
        let bytes = fs::read(path).await?;
        parse_document(path, &bytes)
    }

    /// Write a snapshot of `doc` and return its path.
    pub async fn write_backup(
        &self,
        doc: &QueueDocument,
        label: &str,
        now: DateTime<Utc>,
    ) -> Result<PathBuf, QueueError> {
        let dir = self.backups_dir();
        fs::create_dir_all(&dir).await?;

        let stem = format!(
            "{BACKUP_PREFIX}{}Z-{}",
            now.format(BACKUP_TS_FORMAT),
            sanitize_label(label)
        );
        let mut path = dir.join(format!("{stem}.json"));
        let mut n = 1;
        while fs::try_exists(&path).await? {
            path = dir.join(format!("{stem}-{n}.json"));
            n += 1;
        }

        let json = serde_json::to_vec_pretty(doc)?;
        atomic_write(&path, &json).await?;
        debug!(path = %path.display(), tasks = doc.tasks.len(), "Wrote queue snapshot");
        Ok(path)
    }

    /// Snapshot files, oldest first.
    pub async fn list_backups(&self) -> Result<Vec<PathBuf>, QueueError> {
        let dir = self.backups_dir();
        if !fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }

        let mut backups = Vec::new();
        let mut read_dir = fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            let is_snapshot = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(BACKUP_PREFIX) && n.ends_with(".json"));
            if is_snapshot {
                backups.push(path);
            }
        }
        backups.sort();
        Ok(backups)
    }

    /// Delete snapshots older than `retention_days`. Returns how many went.
    pub async fn prune_backups(
        &self,
        retention_days: u32,
        now: DateTime<Utc>,
    ) -> Result<usize, QueueError> {
        let cutoff = now - chrono::Duration::days(i64::from(retention_days));
        let mut removed = 0;

        for path in self.list_backups().await? {
            let Some(taken_at) = snapshot_time(&path) else {
                debug!(path = %path.display(), "Skipping snapshot with unparseable name");
                continue;
            };
            if taken_at < cutoff {
                match fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to delete old snapshot")
                }
                }
            }
        }

        if removed > 0 {
            info!(removed, retention_days, "Pruned old queue snapshots");
        }
        Ok(removed)
    }

    /// Move an unreadable live document aside so it can be inspected later.
    pub async fn quarantine(&self, now: DateTime<Utc>) -> Result<Option<PathBuf>, QueueError> {
        let live = self.queue_path();
        if !fs::try_exists(&live).await? {
            return Ok(None);
        }
        let target = self.state_dir.join(format!(
            "{QUEUE_FILE}.corrupt-{}",
            now.format(BACKUP_TS_FORMAT)
        ));
        fs::rename(&live, &target).await?;
        warn!(path = %target.display(), "Quarantined corrupt queue document");
        Ok(Some(target))
    }
}

fn parse_document(path: &Path, bytes: &[u8]) -> Result<QueueDocument, QueueError> {
    serde_json::from_slice(bytes).map_err(|e| QueueError::CorruptState {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Write to a sibling temp file, fsync, then rename over the target.
///
/// Readers only ever observe the old or the new content.
pub(crate) async fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent).await?;

    let seq = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = parent.join(format!(".{file_name}.tmp-{}-{seq}", std::process::id()));

    let result = async {
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, path).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path).await;
    }
    result
}

fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '-' })
        .take(40)
        .collect();
    let trimmed = cleaned.trim_matches('-');
    if trimmed.is_empty() {
        "snapshot".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Timestamp encoded in a snapshot file name.
fn snapshot_time(path: &Path) -> Option<DateTime<Utc>> {
    let name = path.file_name()?.to_str()?;
    let rest = name.strip_prefix(BACKUP_PREFIX)?;
    let (ts, _) = rest.split_once('Z')?;
    NaiveDateTime::parse_from_str(ts, BACKUP_TS_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::model::{Task, TaskType};

    fn sample_doc(now: DateTime<Utc>) -> QueueDocument {
        let mut doc = QueueDocument::empty(now);
        doc.tasks
            .push(Task::new(TaskType::Custom, 1, serde_json::Value::from("hello"), now));
        doc.touch(now);
        doc
    }

    #[tokio::test]
    async fn missing_document_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::new(dir.path());
        assert!(store.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_then_read_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::new(dir.path());
        let doc = sample_doc(Utc::now());

        store.write(&doc).await.unwrap();
        let back = store.read().await.unwrap().unwrap();
        assert_eq!(back, doc);
    }

    #[tokio::test]
    async fn garbage_is_corrupt_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::new(dir.path());
        std::fs::write(store.queue_path(), b"{\"version\": 1, \"tas").unwrap();

        let err = store.read().await.unwrap_err();
        assert!(matches!(err, QueueError::CorruptState { .. }));
    }

    #[tokio::test]
    async fn no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::new(dir.path());
        store.write(&sample_doc(Utc::now())).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![QUEUE_FILE.to_string()]);
    }

    #[tokio::test]
    async fn backups_sort_and_prune_by_age() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::new(dir.path());
        let now = Utc::now();
        let doc = sample_doc(now);

        let old = store
            .write_backup(&doc, "scheduled", now - chrono::Duration::days(10))
            .await
            .unwrap();
        let recent = store.write_backup(&doc, "before cleanup", now).await.unwrap();

        let listed = store.list_backups().await.unwrap();
        assert_eq!(listed, vec![old.clone(), recent.clone()]);
        assert!(recent.to_string_lossy().contains("before-cleanup"));

        let removed = store.prune_backups(7, now).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.list_backups().await.unwrap(), vec![recent]);
    }

    #[test]
    fn snapshot_time_parses_file_name() {
        let path = PathBuf::from("/x/backups/queue-20250102T030405.678Z-label.json");
        let ts = snapshot_time(&path).unwrap();
        assert_eq!(ts.to_rfc3339(), "2025-01-02T03:04:05.678+00:00");
    }
}
