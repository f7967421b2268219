use crate::workspace::WorkspaceStatus;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Current lifecycle status of every workspace that is not at rest.
///
/// An absent id means `Stopped`, so the table only holds workspaces that are
/// starting, running, snapshotting or stopping.
#[derive(Debug, Default)]
pub struct StatusTable {
    statuses: RwLock<HashMap<String, WorkspaceStatus>>,
}

impl StatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, WorkspaceStatus>> {
        self.statuses.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, WorkspaceStatus>> {
        self.statuses.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: &str) -> WorkspaceStatus {
        self.read().get(id).copied().unwrap_or_default()
    }

    /// Replace the status; `Stopped` removes the entry.
    pub fn set(&self, id: &str, status: WorkspaceStatus) -> WorkspaceStatus {
        let mut statuses = self.write();
        let previous = if status == WorkspaceStatus::Stopped {
            statuses.remove(id)
        } else {
            statuses.insert(id.to_string(), status)
        };
        previous.unwrap_or_default()
    }

    /// Set `new` only if the current status is `expected`.
    pub fn compare_and_set(
        &self,
        id: &str,
        expected: WorkspaceStatus,
        new: WorkspaceStatus,
    ) -> bool {
        let mut statuses = self.write();
        let current = statuses.get(id).copied().unwrap_or_default();
        if current != expected {
            return false;
        }
        if new == WorkspaceStatus::Stopped {
            statuses.remove(id);
        } else {
            statuses.insert(id.to_string(), new);
        }
        true
    }

    pub fn remove(&self, id: &str) -> WorkspaceStatus {
        self.write().remove(id).unwrap_or_default()
    }

    /// Ids whose status is one of `statuses`, sorted.
    pub fn ids_with(&self, statuses: &[WorkspaceStatus]) -> Vec<String> {
        let mut ids: Vec<String> = self
            .read()
            .iter()
            .filter(|(_, s)| statuses.contains(s))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
