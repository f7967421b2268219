use crate::manager::WorkspaceManager;
use tracing::{debug, error, info};
use ws_core::error::Result;

/// Remove every persisted temporary workspace that has no live runtime.
///
/// Temporary workspaces never outlive their runtime, so the ones found here
/// were left behind by a previous process. Returns the number removed;
/// failures are logged and the workspace is kept.
pub async fn remove_temporary_workspaces(
    manager: &WorkspaceManager,
    page_size: usize,
) -> Result<usize> {
    let page_size = page_size.max(1);
    let runtimes = manager.runtimes();
    let mut skip = 0;
    let mut removed = 0;

    loop {
        let page = manager.store().get_temporary(skip, page_size).await?;
        let fetched = page.len();

        for workspace in page {
            if runtimes.has_runtime(&workspace.id) {
                debug!(workspace_id = %workspace.id, "Keeping temporary workspace with a live runtime");
                skip += 1;
                continue;
            }
            match manager.remove_workspace(&workspace.id).await {
                Ok(()) => {
                    info!(workspace_id = %workspace.id, "Removed leftover temporary workspace '{}'", workspace.key());
                    removed += 1;
                }
                Err(e) => {
                    error!(workspace_id = %workspace.id, "Failed to remove temporary workspace: {}", e);
                    skip += 1;
                }
            }
        }

        if fetched < page_size {
            break;
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::StaticAccountResolver;
    use crate::event::EventBus;
    use crate::lock::KeyedLockTable;
    use crate::pool::TaskPool;
    use crate::runtimes::WorkspaceRuntimes;
    use crate::store::{MemoryWorkspaceStore, WorkspaceStore};
    use crate::test_utils::sample_config;
    use crate::workspace::Workspace;
    use std::sync::Arc;
    use tempfile::TempDir;
    use ws_config::{PolicyDefaults, PoolConfig};
    use ws_infrastructure::mock::FakeInfrastructure;
    use ws_infrastructure::InfrastructureRegistry;
    use ws_snapshot::FileSnapshotStore;

    fn manager(store: Arc<MemoryWorkspaceStore>, snapshots: &TempDir) -> WorkspaceManager {
        let pool = Arc::new(TaskPool::new(&PoolConfig::fixed(2)));
        let registry =
            InfrastructureRegistry::new(vec![Arc::new(FakeInfrastructure::new("fake"))]);
        let runtimes = Arc::new(WorkspaceRuntimes::new(
            registry,
            Arc::new(EventBus::new()),
            Arc::new(KeyedLockTable::new(4)),
            Arc::clone(&pool),
        ));
        WorkspaceManager::new(
            store,
            Arc::new(StaticAccountResolver::new().with_account("alice", "user-alice")),
            runtimes,
            Arc::new(FileSnapshotStore::new(snapshots.path()).unwrap()),
            pool,
            PolicyDefaults::default(),
        )
    }

    #[tokio::test]
    async fn test_removes_only_temporary_workspaces_across_pages() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryWorkspaceStore::new());
        for i in 0..5 {
            let mut ws = Workspace::new(sample_config(&format!("tmp{}", i), "fake"), "alice", "user-alice");
            ws.temporary = true;
            store.create(&ws).await.unwrap();
        }
        let kept = Workspace::new(sample_config("kept", "fake"), "alice", "user-alice");
        store.create(&kept).await.unwrap();

        let manager = manager(Arc::clone(&store), &dir);
        let removed = remove_temporary_workspaces(&manager, 2).await.unwrap();

        assert_eq!(removed, 5);
        assert!(store.get_temporary(0, 10).await.unwrap().is_empty());
        assert!(store.get(&kept.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_keeps_temporary_workspace_with_runtime() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryWorkspaceStore::new());
        let mut ws = Workspace::new(sample_config("busy", "fake"), "alice", "user-alice");
        ws.temporary = true;
        store.create(&ws).await.unwrap();

        let manager = manager(Arc::clone(&store), &dir);
        manager
            .runtimes()
            .start(&ws, None, Default::default())
            .await
            .unwrap();

        assert_eq!(remove_temporary_workspaces(&manager, 10).await.unwrap(), 0);
        assert!(store.get(&ws.id).await.is_ok());
    }
}
