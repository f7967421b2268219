//! Shared fixtures for ws-orchestrator integration tests
//!
//! Every harness runs a full engine over the fake infrastructure, an
//! in-memory workspace store and a snapshot store in a temporary directory.

#![allow(dead_code)]

use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use ws_config::{EngineConfig, Environment, MachineConfig, PoolConfig, Recipe, WorkspaceConfig};
use ws_infrastructure::mock::FakeInfrastructure;
use ws_orchestrator::{
    EventType, MemoryWorkspaceStore, StaticAccountResolver, WorkspaceEngine, WorkspaceEvent,
    WorkspaceManager, WorkspaceStatusEvent,
};
use ws_snapshot::FileSnapshotStore;

pub const RECIPE_TYPE: &str = "fake";
pub const NAMESPACE: &str = "alice";
pub const OWNER_ID: &str = "user-alice";

/// A valid workspace config: environment `main` with one dev machine.
pub fn workspace_config(name: &str) -> WorkspaceConfig {
    let mut machines = IndexMap::new();
    machines.insert("dev-machine".to_string(), MachineConfig::dev());

    let mut environments = IndexMap::new();
    environments.insert(
        "main".to_string(),
        Environment {
            recipe: Recipe::new(RECIPE_TYPE),
            machines,
        },
    );

    WorkspaceConfig {
        name: name.to_string(),
        description: None,
        default_env: "main".to_string(),
        environments,
        commands: Vec::new(),
        projects: Vec::new(),
    }
}

pub fn engine_config(dir: &TempDir) -> EngineConfig {
    EngineConfig {
        pool: PoolConfig::fixed(4),
        db_path: dir.path().join("workspaces.db"),
        snapshots_dir: dir.path().join("snapshots"),
        ..EngineConfig::default()
    }
}

pub struct Harness {
    pub engine: WorkspaceEngine,
    pub fake: Arc<FakeInfrastructure>,
    pub store: Arc<MemoryWorkspaceStore>,
    pub events: UnboundedReceiver<WorkspaceEvent>,
    pub dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with(FakeInfrastructure::new(RECIPE_TYPE), EngineConfig::default()).await
    }

    /// Build over `fake`; pool, paths and janitor come from `config`.
    pub async fn with(fake: FakeInfrastructure, config: EngineConfig) -> Self {
        Self::with_store(fake, config, Arc::new(MemoryWorkspaceStore::new())).await
    }

    pub async fn with_store(
        fake: FakeInfrastructure,
        config: EngineConfig,
        store: Arc<MemoryWorkspaceStore>,
    ) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let fake = Arc::new(fake);
        let config = EngineConfig {
            pool: PoolConfig::fixed(4),
            ..config
        };

        let engine = WorkspaceEngine::builder(config)
            .infrastructure(fake.clone())
            .accounts(Arc::new(
                StaticAccountResolver::new().with_account(NAMESPACE, OWNER_ID),
            ))
            .store(store.clone())
            .snapshot_store(Arc::new(
                FileSnapshotStore::new(dir.path().join("snapshots"))
                    .expect("Failed to create snapshot store"),
            ))
            .build()
            .await
            .expect("Failed to build engine");
        let (_, events) = engine.events().subscribe_channel();

        Self {
            engine,
            fake,
            store,
            events,
            dir,
        }
    }

    pub fn manager(&self) -> &WorkspaceManager {
        self.engine.manager()
    }

    /// Next status change, skipping created/removed events.
    pub async fn next_status(&mut self) -> WorkspaceStatusEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("Timed out waiting for an event")
                .expect("Event channel closed");
            if let WorkspaceEvent::StatusChanged(change) = event {
                return change;
            }
        }
    }

    /// Event types of the next `count` status changes.
    pub async fn next_types(&mut self, count: usize) -> Vec<EventType> {
        let mut types = Vec::with_capacity(count);
        for _ in 0..count {
            types.push(self.next_status().await.event_type);
        }
        types
    }

    /// Wait until a `Removed` event for `workspace_id` arrives.
    pub async fn wait_removed(&mut self, workspace_id: &str) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("Timed out waiting for removal")
                .expect("Event channel closed");
            if matches!(&event, WorkspaceEvent::Removed { workspace_id: id } if id == workspace_id)
            {
                return;
            }
        }
    }
}

/// Poll `check` until it holds or a few seconds pass.
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}
