use super::WorkspaceStore;
use crate::workspace::Workspace;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::sync::{PoisonError, RwLock};
use ws_core::error::{Result, WsError};

/// Workspace store kept in process memory, in creation order.
#[derive(Debug, Default)]
pub struct MemoryWorkspaceStore {
    workspaces: RwLock<IndexMap<String, Workspace>>,
}

impl MemoryWorkspaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn not_found(id: &str) -> WsError {
        WsError::not_found(format!("Workspace with id '{}' doesn't exist", id))
    }

    fn filtered(&self, predicate: impl Fn(&Workspace) -> bool) -> Vec<Workspace> {
        self.workspaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|ws| predicate(ws))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl WorkspaceStore for MemoryWorkspaceStore {
    async fn create(&self, workspace: &Workspace) -> Result<()> {
        let mut workspaces = self
            .workspaces
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if workspaces.contains_key(&workspace.id) {
            return Err(WsError::conflict(format!(
                "Workspace with id '{}' already exists",
                workspace.id
            )));
        }
        if workspaces.values().any(|ws| ws.key() == workspace.key()) {
            return Err(WsError::conflict(format!(
                "Workspace '{}' already exists",
                workspace.key()
            )));
        }
        workspaces.insert(workspace.id.clone(), workspace.clone().at_rest());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Workspace> {
        self.workspaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| Self::not_found(id))
    }

    async fn get_by_name(&self, name: &str, namespace: &str) -> Result<Workspace> {
        self.filtered(|ws| ws.name() == name && ws.namespace == namespace)
            .into_iter()
            .next()
            .ok_or_else(|| {
                WsError::not_found(format!(
                    "Workspace '{}/{}' doesn't exist",
                    namespace, name
                ))
            })
    }

    async fn get_by_namespace(&self, namespace: &str) -> Result<Vec<Workspace>> {
        Ok(self.filtered(|ws| ws.namespace == namespace))
    }

    async fn get_by_owner(&self, owner_id: &str) -> Result<Vec<Workspace>> {
        Ok(self.filtered(|ws| ws.owner_id == owner_id))
    }

    async fn get_temporary(&self, skip: usize, limit: usize) -> Result<Vec<Workspace>> {
        Ok(self
            .filtered(|ws| ws.temporary)
            .into_iter()
            .skip(skip)
            .take(limit)
            .collect())
    }

    async fn update(&self, workspace: &Workspace) -> Result<Workspace> {
        let mut workspaces = self
            .workspaces
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !workspaces.contains_key(&workspace.id) {
            return Err(Self::not_found(&workspace.id));
        }
        if workspaces
            .values()
            .any(|ws| ws.id != workspace.id && ws.key() == workspace.key())
        {
            return Err(WsError::conflict(format!(
                "Workspace '{}' already exists",
                workspace.key()
            )));
        }
        let stored = workspace.clone().at_rest();
        workspaces.insert(workspace.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.workspaces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .shift_remove(id)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(id))
    }
}
