//! Snapshot metadata storage

use crate::metadata::Snapshot;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};
use ws_core::error::{Result, WsError};

/// Storage of snapshot metadata.
///
/// Implementations are synchronous; callers running on an async runtime keep
/// calls short (a handful of small files or rows per workspace).
pub trait SnapshotStore: Send + Sync {
    /// All snapshots of a workspace, newest first.
    fn find_snapshots(&self, workspace_id: &str) -> Result<Vec<Snapshot>>;

    /// The snapshot of one machine, `NotFound` if there is none.
    fn get_snapshot(&self, workspace_id: &str, env_name: &str, machine_name: &str)
        -> Result<Snapshot>;

    /// Store a new snapshot, `Conflict` if its id is already taken.
    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    /// Store `new_snapshots` in place of every existing snapshot of the
    /// workspace environment. Returns the snapshots that were replaced.
    fn replace_snapshots(
        &self,
        workspace_id: &str,
        env_name: &str,
        new_snapshots: &[Snapshot],
    ) -> Result<Vec<Snapshot>>;

    /// Remove snapshot metadata, `NotFound` if the id is unknown.
    fn remove_snapshot(&self, snapshot_id: &str) -> Result<()>;
}

/// File backed store: `<root>/<workspace_id>/<snapshot_id>.json`.
pub struct FileSnapshotStore {
    snapshots_dir: PathBuf,
    // Serializes writers; readers only see complete files thanks to rename.
    write_lock: Mutex<()>,
}

impl FileSnapshotStore {
    /// Create a store rooted at `snapshots_dir`, creating the directory if needed.
    pub fn new(snapshots_dir: impl Into<PathBuf>) -> Result<Self> {
        let snapshots_dir = snapshots_dir.into();
        std::fs::create_dir_all(&snapshots_dir)?;
        Ok(Self {
            snapshots_dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.snapshots_dir
    }

    fn workspace_dir(&self, workspace_id: &str) -> PathBuf {
        self.snapshots_dir.join(workspace_id)
    }

    fn snapshot_file(&self, workspace_id: &str, snapshot_id: &str) -> PathBuf {
        self.workspace_dir(workspace_id)
            .join(format!("{snapshot_id}.json"))
    }

    fn read_dir_snapshots(&self, dir: &Path) -> Result<Vec<(PathBuf, Snapshot)>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut snapshots = Vec::new();
        for entry in std::fs::read_dir(dir)?.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Snapshot::load(&path) {
                Ok(snapshot) => snapshots.push((path, snapshot)),
                Err(e) => warn!(
                    "Failed to load snapshot metadata from {}: {}",
                    path.display(),
                    e
                ),
            }
        }
        Ok(snapshots)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_new(&self, snapshot: &Snapshot) -> Result<()> {
        if snapshot.workspace_id.trim().is_empty() || snapshot.id.trim().is_empty() {
            return Err(WsError::bad_request(
                "Snapshot must have an id and a workspace id",
            ));
        }
        let path = self.snapshot_file(&snapshot.workspace_id, &snapshot.id);
        if path.exists() {
            return Err(WsError::conflict(format!(
                "Snapshot '{}' already exists",
                snapshot.id
            )));
        }
        std::fs::create_dir_all(self.workspace_dir(&snapshot.workspace_id))?;
        snapshot.save(&path)
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn find_snapshots(&self, workspace_id: &str) -> Result<Vec<Snapshot>> {
        let mut snapshots: Vec<Snapshot> = self
            .read_dir_snapshots(&self.workspace_dir(workspace_id))?
            .into_iter()
            .map(|(_, snapshot)| snapshot)
            .collect();

        // Sort by creation time, newest first
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(snapshots)
    }

    fn get_snapshot(
        &self,
        workspace_id: &str,
        env_name: &str,
        machine_name: &str,
    ) -> Result<Snapshot> {
        self.find_snapshots(workspace_id)?
            .into_iter()
            .find(|s| s.env_name == env_name && s.machine_name == machine_name)
            .ok_or_else(|| {
                WsError::not_found(format!(
                    "Snapshot for machine '{}' of environment '{}' in workspace '{}' doesn't exist",
                    machine_name, env_name, workspace_id
                ))
            })
    }

    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let _guard = self.lock();
        self.write_new(snapshot)
    }

    fn replace_snapshots(
        &self,
        workspace_id: &str,
        env_name: &str,
        new_snapshots: &[Snapshot],
    ) -> Result<Vec<Snapshot>> {
        let _guard = self.lock();

        let replaced: Vec<(PathBuf, Snapshot)> = self
            .read_dir_snapshots(&self.workspace_dir(workspace_id))?
            .into_iter()
            .filter(|(_, s)| s.env_name == env_name)
            .collect();

        for snapshot in new_snapshots {
            if snapshot.workspace_id != workspace_id || snapshot.env_name != env_name {
                return Err(WsError::bad_request(format!(
                    "Snapshot '{}' doesn't belong to environment '{}' of workspace '{}'",
                    snapshot.id, env_name, workspace_id
                )));
            }
        }

        for (path, _) in &replaced {
            std::fs::remove_file(path)?;
        }
        for snapshot in new_snapshots {
            self.write_new(snapshot)?;
        }

        debug!(
            workspace_id,
            env = env_name,
            "Replaced {} snapshot(s) with {}",
            replaced.len(),
            new_snapshots.len()
        );
        Ok(replaced.into_iter().map(|(_, s)| s).collect())
    }

    fn remove_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let _guard = self.lock();

        for entry in std::fs::read_dir(&self.snapshots_dir)?.filter_map(|e| e.ok()) {
            let path = entry.path().join(format!("{snapshot_id}.json"));
            if path.is_file() {
                std::fs::remove_file(&path)?;
                // Drop the workspace directory once its last snapshot is gone.
                let dir = entry.path();
                if std::fs::read_dir(&dir)?.next().is_none() {
                    let _ = std::fs::remove_dir(&dir);
                }
                return Ok(());
            }
        }

        Err(WsError::not_found(format!(
            "Snapshot '{}' doesn't exist",
            snapshot_id
        )))
    }
}
