//! Composition root of the workspace engine.

use crate::account::{AccountResolver, StaticAccountResolver};
use crate::db::backup_database;
use crate::event::EventBus;
use crate::janitor::remove_temporary_workspaces;
use crate::lock::KeyedLockTable;
use crate::manager::WorkspaceManager;
use crate::pool::TaskPool;
use crate::runtimes::WorkspaceRuntimes;
use crate::store::{SqliteWorkspaceStore, WorkspaceStore};
use std::sync::Arc;
use tracing::{error, info};
use ws_config::EngineConfig;
use ws_core::error::Result;
use ws_infrastructure::{InfrastructureRegistry, RuntimeInfrastructure};
use ws_logging::WorkerGuard;
use ws_snapshot::{FileSnapshotStore, SnapshotStore};

pub struct WorkspaceEngineBuilder {
    config: EngineConfig,
    infrastructures: Vec<Arc<dyn RuntimeInfrastructure>>,
    accounts: Option<Arc<dyn AccountResolver>>,
    store: Option<Arc<dyn WorkspaceStore>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    init_logging: bool,
}

impl WorkspaceEngineBuilder {
    pub fn infrastructure(mut self, infrastructure: Arc<dyn RuntimeInfrastructure>) -> Self {
        self.infrastructures.push(infrastructure);
        self
    }

    pub fn accounts(mut self, accounts: Arc<dyn AccountResolver>) -> Self {
        self.accounts = Some(accounts);
        self
    }

    /// Use `store` instead of the SQLite database at `db_path`.
    pub fn store(mut self, store: Arc<dyn WorkspaceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use `snapshots` instead of the file store under `snapshots_dir`.
    pub fn snapshot_store(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Install the global tracing subscriber from the `logging` settings.
    pub fn init_logging(mut self) -> Self {
        self.init_logging = true;
        self
    }

    /// Wire the engine, adopt surviving runtimes and clean up leftovers.
    pub async fn build(self) -> Result<WorkspaceEngine> {
        let config = self.config;
        let log_guard = if self.init_logging {
            ws_logging::init_subscriber(&config.logging)
        } else {
            None
        };

        let store: Arc<dyn WorkspaceStore> = match self.store {
            Some(store) => store,
            None => {
                let db_path = &config.db_path;
                if db_path.exists() {
                    let backup_path = backup_database(db_path)?;
                    info!("Database backed up to: {}", backup_path.display());
                }
                info!("Database path: {}", db_path.display());
                Arc::new(SqliteWorkspaceStore::connect(db_path).await?)
            }
        };
        let snapshots: Arc<dyn SnapshotStore> = match self.snapshots {
            Some(snapshots) => snapshots,
            None => Arc::new(FileSnapshotStore::new(config.snapshots_dir.clone())?),
        };
        let accounts = self
            .accounts
            .unwrap_or_else(|| Arc::new(StaticAccountResolver::new()));

        let events = Arc::new(EventBus::new());
        let pool = Arc::new(TaskPool::new(&config.pool));
        let locks = Arc::new(KeyedLockTable::new(config.lock_stripes));
        let registry = InfrastructureRegistry::new(self.infrastructures);
        info!(
            "Infrastructures registered for recipe types: {}",
            registry.recipe_types().join(", ")
        );

        let runtimes = Arc::new(WorkspaceRuntimes::new(
            registry,
            Arc::clone(&events),
            locks,
            Arc::clone(&pool),
        ));
        let manager = WorkspaceManager::new(
            Arc::clone(&store),
            accounts,
            Arc::clone(&runtimes),
            snapshots,
            Arc::clone(&pool),
            config.defaults,
        );

        let recovered = runtimes.recover(store.as_ref()).await;
        if recovered > 0 {
            info!("Recovered {} running workspace(s)", recovered);
        }

        if config.janitor.enabled {
            match remove_temporary_workspaces(&manager, config.janitor.page_size).await {
                Ok(0) => {}
                Ok(removed) => info!("Removed {} leftover temporary workspace(s)", removed),
                Err(e) => error!("Temporary workspace cleanup failed: {}", e),
            }
        }

        Ok(WorkspaceEngine {
            config,
            events,
            pool,
            runtimes,
            manager,
            _log_guard: log_guard,
        })
    }
}

/// A running engine: manager, registry and the pool they share.
pub struct WorkspaceEngine {
    config: EngineConfig,
    events: Arc<EventBus>,
    pool: Arc<TaskPool>,
    runtimes: Arc<WorkspaceRuntimes>,
    manager: WorkspaceManager,
    _log_guard: Option<WorkerGuard>,
}

impl WorkspaceEngine {
    pub fn builder(config: EngineConfig) -> WorkspaceEngineBuilder {
        WorkspaceEngineBuilder {
            config,
            infrastructures: Vec::new(),
            accounts: None,
            store: None,
            snapshots: None,
            init_logging: false,
        }
    }

    pub fn manager(&self) -> &WorkspaceManager {
        &self.manager
    }

    pub fn runtimes(&self) -> &Arc<WorkspaceRuntimes> {
        &self.runtimes
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stop every active workspace, then drain the pool.
    pub async fn shutdown(&self) {
        info!("Shutting down workspace engine");
        self.manager.shutdown().await;
        self.pool.shutdown().await;
        info!("Workspace engine stopped");
    }
}
