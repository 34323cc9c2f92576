//! Project registry with write-behind persistence.
//!
//! Reads and writes hit the in-memory map; every mutation marks the store
//! dirty and wakes the writer task, which waits out the debounce window and
//! then persists one snapshot for the whole burst. Snapshots are written to
//! a temp file and renamed over the old one. [`SnapshotStore::flush`] must be
//! awaited before the process exits, otherwise the last burst is lost.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::models::{Project, ProjectId, ProjectPatch};
use crate::errors::OrchestratorError;

const SNAPSHOT_VERSION: u32 = 1;

/// Accessors the orchestration core needs from the project registry.
pub trait ProjectStore: Send + Sync {
    fn get_project(&self, id: &str) -> Option<Project>;

    fn list_projects(&self) -> Vec<Project>;

    fn insert_project(&self, project: Project) -> Result<Project, OrchestratorError>;

    fn update_project(&self, id: &str, patch: &ProjectPatch) -> Result<Project, OrchestratorError>;

    fn delete_project(&self, id: &str) -> Result<Project, OrchestratorError>;
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    projects: Vec<Project>,
}

pub struct SnapshotStore {
    path: Option<PathBuf>,
    debounce: Duration,
    projects: Mutex<BTreeMap<ProjectId, Project>>,
    dirty: AtomicBool,
    changed: Notify,
    write_lock: tokio::sync::Mutex<()>,
}

impl SnapshotStore {
    /// A store that never touches disk (tests, `--no-persist` style setups).
    pub fn in_memory() -> Self {
        Self::with_projects(None, Duration::ZERO, BTreeMap::new())
    }

    /// Load the snapshot at `path`. A missing file is an empty registry.
    pub fn load(path: &Path, debounce: Duration) -> Result<Self> {
        let projects = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read project snapshot {}", path.display()))?;
            let snapshot: Snapshot = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse project snapshot {}", path.display()))?;
            if snapshot.version != SNAPSHOT_VERSION {
                anyhow::bail!(
                    "Unsupported project snapshot version {} in {}",
                    snapshot.version,
                    path.display()
                );
            }
            snapshot
                .projects
                .into_iter()
                .map(|p| (p.id.clone(), p))
                .collect()
        } else {
            BTreeMap::new()
        };
        info!(path = %path.display(), projects = projects.len(), "Loaded project snapshot");
        Ok(Self::with_projects(Some(path.to_path_buf()), debounce, projects))
    }

    fn with_projects(
        path: Option<PathBuf>,
        debounce: Duration,
        projects: BTreeMap<ProjectId, Project>,
    ) -> Self {
        Self {
            path,
            debounce,
            projects: Mutex::new(projects),
            dirty: AtomicBool::new(false),
            changed: Notify::new(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ProjectId, Project>> {
        self.projects.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        self.changed.notify_one();
    }

    /// Persist changes in the background, one write per debounce window.
    pub fn spawn_writer(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                store.changed.notified().await;
                tokio::time::sleep(store.debounce).await;
                if let Err(e) = store.flush().await {
                    warn!("Failed to persist project snapshot: {:#}", e);
                }
            }
        })
    }

    /// Write the current state if anything changed since the last write.
    /// Returns whether a snapshot was written.
    pub async fn flush(&self) -> Result<bool> {
        let Some(ref path) = self.path else {
            self.dirty.store(false, Ordering::SeqCst);
            return Ok(false);
        };
        let _guard = self.write_lock.lock().await;
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            projects: self.lock().values().cloned().collect(),
        };
        let result = write_atomic(path, &snapshot).await;
        if result.is_err() {
            // Keep the changes pending so the next flush retries them.
            self.dirty.store(true, Ordering::SeqCst);
        } else {
            debug!(path = %path.display(), projects = snapshot.projects.len(), "Persisted project snapshot");
        }
        result.map(|()| true)
    }
}

async fn write_atomic(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let json = serde_json::to_string_pretty(snapshot).context("Failed to serialize project snapshot")?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

impl ProjectStore for SnapshotStore {
    fn get_project(&self, id: &str) -> Option<Project> {
        self.lock().get(id).cloned()
    }

    fn list_projects(&self) -> Vec<Project> {
        let mut projects: Vec<Project> = self.lock().values().cloned().collect();
        projects.sort_by_key(|p| p.created_at);
        projects
    }

    fn insert_project(&self, project: Project) -> Result<Project, OrchestratorError> {
        let mut projects = self.lock();
        if projects.contains_key(&project.id) {
            return Err(OrchestratorError::ProjectExists { id: project.id });
        }
        projects.insert(project.id.clone(), project.clone());
        drop(projects);
        self.mark_dirty();
        Ok(project)
    }

    fn update_project(&self, id: &str, patch: &ProjectPatch) -> Result<Project, OrchestratorError> {
        let mut projects = self.lock();
        let project = projects
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::ProjectNotFound { id: id.to_string() })?;
        patch.apply(project);
        let updated = project.clone();
        drop(projects);
        self.mark_dirty();
        Ok(updated)
    }

    fn delete_project(&self, id: &str) -> Result<Project, OrchestratorError> {
        let removed = self
            .lock()
            .remove(id)
            .ok_or_else(|| OrchestratorError::ProjectNotFound { id: id.to_string() })?;
        self.mark_dirty();
        Ok(removed)
    }
}
