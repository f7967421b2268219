//! Persistence of workspace records.
//!
//! Stores hold configuration and attributes only. Status and runtime are
//! derived from the runtime registry, so every workspace read from a store is
//! `Stopped` with no runtime.

use crate::workspace::Workspace;
use async_trait::async_trait;
use ws_core::error::Result;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryWorkspaceStore;
pub use sqlite::SqliteWorkspaceStore;

#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    /// Persist a new workspace; `Conflict` if the id or `namespace/name` is taken.
    async fn create(&self, workspace: &Workspace) -> Result<()>;

    /// `NotFound` if there is no such workspace.
    async fn get(&self, id: &str) -> Result<Workspace>;

    async fn get_by_name(&self, name: &str, namespace: &str) -> Result<Workspace>;

    async fn get_by_namespace(&self, namespace: &str) -> Result<Vec<Workspace>>;

    async fn get_by_owner(&self, owner_id: &str) -> Result<Vec<Workspace>>;

    /// A page of temporary workspaces, oldest first.
    async fn get_temporary(&self, skip: usize, limit: usize) -> Result<Vec<Workspace>>;

    /// Replace the stored workspace; `NotFound` if it doesn't exist.
    async fn update(&self, workspace: &Workspace) -> Result<Workspace>;

    /// `NotFound` if there is no such workspace.
    async fn remove(&self, id: &str) -> Result<()>;
}
