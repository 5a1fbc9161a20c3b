//! Session registry: which assistant session serves which project.
//!
//! Keeps a bidirectional map between project ids and session handles so a
//! cycle can tell in O(1) whether a live session already exists. Records are
//! mirrored to one JSON file per project and reloaded on start.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::SessionError;
use crate::queue::store::atomic_write;

/// Longest slug kept in a project id (the hash suffix disambiguates).
const MAX_SLUG_LEN: usize = 40;

static PROJECT_IDS: LazyLock<Mutex<HashMap<PathBuf, ProjectId>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn validate_identifier(raw: &str) -> Result<(), SessionError> {
    let invalid = |reason: String| SessionError::InvalidIdentifier {
        value: raw.to_string(),
        reason,
    };
    if raw.is_empty() || raw.len() > 128 {
        return Err(invalid("must be 1-128 characters".into()));
    }
    if let Some(bad) = raw
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(invalid(format!("unsafe character {bad:?}")));
    }
    if raw.starts_with('.') {
        return Err(invalid("must not start with '.'".into()));
    }
    Ok(())
}

/// Stable identifier for a project directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProjectId(String);

impl ProjectId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, SessionError> {
        let raw = raw.into();
        validate_identifier(&raw)?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ProjectId {
    type Error = SessionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ProjectId> for String {
    fn from(id: ProjectId) -> Self {
        id.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of a running assistant session (a tmux session name, for instance).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionHandle(String);

impl SessionHandle {
    pub fn parse(raw: impl Into<String>) -> Result<Self, SessionError> {
        let raw = raw.into();
        validate_identifier(&raw)?;
        Ok(Self(raw))
    }

    /// Conventional handle for a project's session: `autopilot-<project_id>`.
    pub fn for_project(project_id: &ProjectId) -> Self {
        Self(format!("autopilot-{}", project_id.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SessionHandle {
    type Error = SessionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<SessionHandle> for String {
    fn from(handle: SessionHandle) -> Self {
        handle.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic id for a project path: `<slug>-<8 hex chars of sha256>`.
///
/// The path is made absolute first; results are cached for the process.
pub fn project_id(path: &Path) -> ProjectId {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());

    let mut cache = PROJECT_IDS.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(id) = cache.get(&absolute) {
        return id.clone();
    }

    let id = compute_project_id(&absolute);
    cache.insert(absolute, id.clone());
    id
}

fn compute_project_id(absolute: &Path) -> ProjectId {
    let text = absolute.to_string_lossy();

    let mut slug = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-');
    let slug = if slug.len() > MAX_SLUG_LEN {
        slug[slug.len() - MAX_SLUG_LEN..].trim_start_matches('-')
    } else {
        slug
    };
    let slug = if slug.is_empty() { "project" } else { slug };

    let digest = Sha256::digest(text.as_bytes());
    let suffix: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();

    ProjectId(format!("{slug}-{suffix}"))
}

/// Lifecycle of an assistant session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Running,
    UsageLimited,
    Recovering,
    Error,
    Terminated,
}

impl SessionState {
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, target),
            (Starting, Running) | (Starting, Error) | (Starting, Terminated) |
            (Running, UsageLimited) | (Running, Recovering) | (Running, Error) |
            (Running, Terminated) |
            (UsageLimited, Running) | (UsageLimited, Recovering) | (UsageLimited, Error) |
            (UsageLimited, Terminated) |
            (Recovering, Running) | (Recovering, Starting) | (Recovering, Error) |
            (Recovering, Terminated) |
            (Error, Recovering) | (Error, Starting) | (Error, Terminated) |
            (Terminated, Starting)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::UsageLimited => "usage_limited",
            Self::Recovering => "recovering",
            Self::Error => "error",
            Self::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

/// Everything tracked about one project's session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub project_id: ProjectId,
    pub session_handle: SessionHandle,
    pub name: String,
    pub project_path: PathBuf,
    pub state: SessionState,
    pub restart_count: u32,
    /// Restarts since the session last passed a health check.
    #[serde(default)]
    pub consecutive_restarts: u32,
    pub recovery_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Process-local registry, optionally mirrored to disk.
pub struct SessionRegistry {
    records: HashMap<ProjectId, SessionRecord>,
    by_handle: HashMap<SessionHandle, ProjectId>,
    max_tracked: usize,
    persist_dir: Option<PathBuf>,
    clock: Arc<dyn Clock>,
}

impl SessionRegistry {
    /// In-memory registry.
    pub fn new(max_tracked: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: HashMap::new(),
            by_handle: HashMap::new(),
            max_tracked: max_tracked.max(1),
            persist_dir: None,
            clock,
        }
    }

    /// Registry backed by `dir`, rebuilt from the session files found there.
    ///
    /// Unreadable files are skipped with a warning.
    pub async fn load_from_dir(
        dir: impl Into<PathBuf>,
        max_tracked: usize,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SessionError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let mut registry = Self::new(max_tracked, clock);
        registry.persist_dir = Some(dir.clone());

        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable session file");
                    continue;
                }
            };
            match serde_json::from_slice::<SessionRecord>(&bytes) {
                Ok(record) => registry.insert(record),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping malformed session file")
                }
            }
        }

        let evicted = registry.evict_over_bound(None).await?;
        info!(
            dir = %dir.display(),
            sessions = registry.records.len(),
            evicted = evicted.len(),
            "Loaded session registry"
        );
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Track `handle` as the session for `project_id`.
    ///
    /// Re-registering a project replaces its handle but keeps its counters.
    pub async fn register(
        &mut self,
        handle: SessionHandle,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        project_id: ProjectId,
    ) -> Result<&SessionRecord, SessionError> {
        let now = self.clock.now();
        let previous = self.records.remove(&project_id);
        if let Some(prev) = &previous {
            self.by_handle.remove(&prev.session_handle);
        }
        // A handle serves one project at a time.
        if let Some(other) = self.by_handle.get(&handle).cloned() {
            self.forget(&other).await?;
        }

        let record = SessionRecord {
            project_id: project_id.clone(),
            session_handle: handle,
            name: name.into(),
            project_path: path.into(),
            state: SessionState::Starting,
            restart_count: previous.as_ref().map_or(0, |p| p.restart_count),
            consecutive_restarts: previous.as_ref().map_or(0, |p| p.consecutive_restarts),
            recovery_count: previous.as_ref().map_or(0, |p| p.recovery_count),
            created_at: previous.as_ref().map_or(now, |p| p.created_at),
            last_seen: now,
        };
        info!(
            project_id = %record.project_id,
            handle = %record.session_handle,
            "Registered session"
        );
        self.persist(&record).await?;
        self.insert(record);
        self.evict_over_bound(Some(&project_id)).await?;

        self.records
            .get(&project_id)
            .ok_or_else(|| SessionError::NotRegistered(project_id.to_string()))
    }

    pub fn find_by_project(&self, project_id: &ProjectId) -> Option<&SessionHandle> {
        self.records.get(project_id).map(|r| &r.session_handle)
    }

    pub fn find_by_handle(&self, handle: &SessionHandle) -> Option<&ProjectId> {
        self.by_handle.get(handle)
    }

    pub fn get(&self, project_id: &ProjectId) -> Option<&SessionRecord> {
        self.records.get(project_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &SessionRecord> {
        self.records.values()
    }

    /// Move the session to `state`. Same-state updates only refresh `last_seen`.
    pub async fn update_state(
        &mut self,
        project_id: &ProjectId,
        state: SessionState,
    ) -> Result<(), SessionError> {
        let now = self.clock.now();
        let record = self.record_mut(project_id)?;
        if record.state != state {
            if !record.state.can_transition_to(state) {
                return Err(SessionError::InvalidTransition {
                    handle: record.session_handle.to_string(),
                    from: record.state.to_string(),
                    to: state.to_string(),
                });
            }
            debug!(
                project_id = %project_id,
                from = %record.state,
                to = %state,
                "Session state change"
            );
            record.state = state;
        }
        record.last_seen = now;
        let snapshot = record.clone();
        self.persist(&snapshot).await
    }

    /// Count a session restart. Returns the restarts in the current
    /// unhealthy episode.
    pub async fn record_restart(&mut self, project_id: &ProjectId) -> Result<u32, SessionError> {
        let now = self.clock.now();
        let record = self.record_mut(project_id)?;
        record.restart_count += 1;
        record.consecutive_restarts += 1;
        record.last_seen = now;
        let snapshot = record.clone();
        self.persist(&snapshot).await?;
        Ok(snapshot.consecutive_restarts)
    }

    /// The session passed a health check: mark it seen and close any
    /// unhealthy episode.
    pub async fn mark_healthy(&mut self, project_id: &ProjectId) -> Result<(), SessionError> {
        let now = self.clock.now();
        let record = self.record_mut(project_id)?;
        if record.consecutive_restarts > 0 {
            debug!(
                project_id = %project_id,
                restarts = record.consecutive_restarts,
                "Session healthy again"
            );
        }
        record.consecutive_restarts = 0;
        record.last_seen = now;
        let snapshot = record.clone();
        self.persist(&snapshot).await
    }

    /// Count a usage-limit recovery. Returns the new total.
    pub async fn record_recovery(&mut self, project_id: &ProjectId) -> Result<u32, SessionError> {
        let now = self.clock.now();
        let record = self.record_mut(project_id)?;
        record.recovery_count += 1;
        record.last_seen = now;
        let snapshot = record.clone();
        self.persist(&snapshot).await?;
        Ok(snapshot.recovery_count)
    }

    /// Stop tracking a project and delete its session file.
    pub async fn remove(
        &mut self,
        project_id: &ProjectId,
    ) -> Result<Option<SessionRecord>, SessionError> {
        let removed = self.forget(project_id).await?;
        if removed.is_some() {
            info!(project_id = %project_id, "Removed session record");
        }
        Ok(removed)
    }

    /// Drop sessions not seen for `max_idle`. Returns the removed project ids.
    pub async fn cleanup_inactive(
        &mut self,
        max_idle: Duration,
    ) -> Result<Vec<ProjectId>, SessionError> {
        let Some(cutoff) = chrono::Duration::from_std(max_idle)
            .ok()
            .and_then(|idle| self.clock.now().checked_sub_signed(idle))
        else {
            return Ok(Vec::new());
        };
        let stale: Vec<ProjectId> = self
            .records
            .values()
            .filter(|r| r.last_seen < cutoff)
            .map(|r| r.project_id.clone())
            .collect();

        for id in &stale {
            self.forget(id).await?;
        }
        if !stale.is_empty() {
            info!(removed = stale.len(), "Cleaned up inactive sessions");
        }
        Ok(stale)
    }

    fn record_mut(&mut self, project_id: &ProjectId) -> Result<&mut SessionRecord, SessionError> {
        self.records
            .get_mut(project_id)
            .ok_or_else(|| SessionError::NotRegistered(project_id.to_string()))
    }

    fn insert(&mut self, record: SessionRecord) {
        if let Some(old) = self.records.get(&record.project_id) {
            self.by_handle.remove(&old.session_handle);
        }
        self.by_handle
            .insert(record.session_handle.clone(), record.project_id.clone());
        self.records.insert(record.project_id.clone(), record);
    }

    async fn forget(
        &mut self,
        project_id: &ProjectId,
    ) -> Result<Option<SessionRecord>, SessionError> {
        let Some(record) = self.records.remove(project_id) else {
            return Ok(None);
        };
        self.by_handle.remove(&record.session_handle);
        if let Some(path) = self.record_path(project_id) {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Some(record))
    }

    /// Evict least-recently-seen records until within bounds, never `keep`.
    async fn evict_over_bound(
        &mut self,
        keep: Option<&ProjectId>,
    ) -> Result<Vec<ProjectId>, SessionError> {
        let mut evicted = Vec::new();
        while self.records.len() > self.max_tracked {
            let victim = self
                .records
                .values()
                .filter(|r| Some(&r.project_id) != keep)
                .min_by_key(|r| r.last_seen)
                .map(|r| r.project_id.clone());
            let Some(victim) = victim else { break };
            debug!(project_id = %victim, "Evicting least recently seen session");
            self.forget(&victim).await?;
            evicted.push(victim);
        }
        Ok(evicted)
    }

    fn record_path(&self, project_id: &ProjectId) -> Option<PathBuf> {
        self.persist_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", project_id.as_str())))
    }

    async fn persist(&self, record: &SessionRecord) -> Result<(), SessionError> {
        let Some(path) = self.record_path(&record.project_id) else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(record)?;
        atomic_write(&path, &json).await?;
        Ok(())
    }
}
