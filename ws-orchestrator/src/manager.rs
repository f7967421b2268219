//! Entry point for workspace operations.
//!
//! The manager keeps the store and the runtime registry consistent: the store
//! holds configuration, the registry holds live status. It also owns the
//! policies around a lifecycle: restore from snapshot, snapshot before stop,
//! and removal of temporary workspaces.

use crate::account::AccountResolver;
use crate::event::{EventBus, WorkspaceEvent};
use crate::pool::{CountDownLatch, TaskHandle, TaskPool};
use crate::runtimes::{StartTask, WorkspaceRuntimes};
use crate::store::WorkspaceStore;
use crate::workspace::{attributes, Workspace, WorkspaceStatus};
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use ws_config::{MachineConfig, PolicyDefaults, WorkspaceConfig, WorkspaceConfigValidator};
use ws_core::error::{require_non_empty, Result, WsError};
use ws_core::Subject;
use ws_infrastructure::{InternalRuntime, Machine, StartOptions, StopOptions};
use ws_snapshot::{Snapshot, SnapshotStore};

use WorkspaceStatus::{Running, Snapshotting, Starting, Stopped};

/// A workspace whose start was dispatched.
#[must_use = "the start outcome is only observable through `completion`"]
#[derive(Debug)]
pub struct WorkspaceOperation {
    /// The workspace as it was when the start was dispatched, `STARTING`
    pub workspace: Workspace,
    pub completion: TaskHandle<()>,
}

impl WorkspaceOperation {
    /// Wait for the start to complete.
    pub async fn wait(self) -> Result<()> {
        self.completion.await
    }
}

#[derive(Clone)]
pub struct WorkspaceManager {
    store: Arc<dyn WorkspaceStore>,
    accounts: Arc<dyn AccountResolver>,
    runtimes: Arc<WorkspaceRuntimes>,
    snapshots: Arc<dyn SnapshotStore>,
    events: Arc<EventBus>,
    pool: Arc<TaskPool>,
    validator: WorkspaceConfigValidator,
    defaults: PolicyDefaults,
}

impl WorkspaceManager {
    pub fn new(
        store: Arc<dyn WorkspaceStore>,
        accounts: Arc<dyn AccountResolver>,
        runtimes: Arc<WorkspaceRuntimes>,
        snapshots: Arc<dyn SnapshotStore>,
        pool: Arc<TaskPool>,
        defaults: PolicyDefaults,
    ) -> Self {
        Self {
            store,
            accounts,
            events: Arc::clone(runtimes.events()),
            runtimes,
            snapshots,
            pool,
            validator: WorkspaceConfigValidator::new(),
            defaults,
        }
    }

    pub fn runtimes(&self) -> &Arc<WorkspaceRuntimes> {
        &self.runtimes
    }

    pub fn store(&self) -> &Arc<dyn WorkspaceStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    fn validate_config(&self, config: &WorkspaceConfig) -> Result<()> {
        self.validator.validate(config)?;
        for environment in config.environments.values() {
            self.runtimes.validate(environment)?;
        }
        Ok(())
    }

    /// Create a stopped workspace owned by the account of `namespace`.
    pub async fn create_workspace(
        &self,
        config: WorkspaceConfig,
        namespace: &str,
        attrs: IndexMap<String, String>,
    ) -> Result<Workspace> {
        self.create(config, namespace, attrs, false).await
    }

    async fn create(
        &self,
        config: WorkspaceConfig,
        namespace: &str,
        attrs: IndexMap<String, String>,
        temporary: bool,
    ) -> Result<Workspace> {
        require_non_empty(namespace, "namespace")?;
        self.validate_config(&config)?;
        let account = self.accounts.get_by_name(namespace).await?;

        let mut workspace = Workspace::new(config, namespace, account.id);
        workspace.attributes = attrs;
        workspace.temporary = temporary;
        workspace.stamp(attributes::CREATED);
        self.store.create(&workspace).await?;

        self.events
            .publish(WorkspaceEvent::Created(Box::new(workspace.clone())));
        info!(
            workspace_id = %workspace.id,
            "Workspace '{}' created by user '{}'",
            workspace.key(),
            Subject::current_name_or("system")
        );
        Ok(workspace)
    }

    /// Workspace by id, or by `namespace/name`.
    pub async fn get_workspace(&self, key: &str) -> Result<Workspace> {
        require_non_empty(key, "workspace key")?;
        let mut workspace = match key.rsplit_once('/') {
            Some((namespace, name)) => self.store.get_by_name(name, namespace).await?,
            None => self.store.get(key).await?,
        };
        self.runtimes.inject_runtime(&mut workspace).await;
        Ok(workspace)
    }

    pub async fn get_workspace_by_name(&self, name: &str, namespace: &str) -> Result<Workspace> {
        require_non_empty(name, "workspace name")?;
        require_non_empty(namespace, "namespace")?;
        let mut workspace = self.store.get_by_name(name, namespace).await?;
        self.runtimes.inject_runtime(&mut workspace).await;
        Ok(workspace)
    }

    /// Workspaces of an owner; without `include_runtimes` only the status is set.
    pub async fn get_workspaces(
        &self,
        owner_id: &str,
        include_runtimes: bool,
    ) -> Result<Vec<Workspace>> {
        require_non_empty(owner_id, "owner id")?;
        let workspaces = self.store.get_by_owner(owner_id).await?;
        Ok(self.overlay(workspaces, include_runtimes).await)
    }

    pub async fn get_by_namespace(
        &self,
        namespace: &str,
        include_runtimes: bool,
    ) -> Result<Vec<Workspace>> {
        require_non_empty(namespace, "namespace")?;
        let workspaces = self.store.get_by_namespace(namespace).await?;
        Ok(self.overlay(workspaces, include_runtimes).await)
    }

    async fn overlay(&self, mut workspaces: Vec<Workspace>, include_runtimes: bool) -> Vec<Workspace> {
        for workspace in &mut workspaces {
            if include_runtimes {
                self.runtimes.inject_runtime(workspace).await;
            } else {
                self.runtimes.inject_status(workspace);
            }
        }
        workspaces
    }

    /// Replace the configuration, attributes and temporary flag of a workspace.
    pub async fn update_workspace(&self, id: &str, update: Workspace) -> Result<Workspace> {
        require_non_empty(id, "workspace id")?;
        self.validate_config(&update.config)?;

        let mut workspace = self.store.get(id).await?;
        workspace.config = update.config;
        workspace.attributes = update.attributes;
        workspace.temporary = update.temporary;
        workspace.stamp(attributes::UPDATED);

        let mut updated = self.store.update(&workspace).await?;
        self.runtimes.inject_runtime(&mut updated).await;
        info!(workspace_id = %id, "Workspace '{}' updated", updated.key());
        Ok(updated)
    }

    /// Remove a stopped workspace and its snapshots.
    pub async fn remove_workspace(&self, id: &str) -> Result<()> {
        require_non_empty(id, "workspace id")?;
        let status = self.runtimes.status(id);
        if self.runtimes.has_runtime(id) || status != Stopped {
            return Err(WsError::conflict(format!(
                "Workspace '{}' can't be removed because its status is '{}'",
                id, status
            )));
        }

        self.store.remove(id).await?;
        self.purge_snapshots(id);
        self.events.publish(WorkspaceEvent::Removed {
            workspace_id: id.to_string(),
        });
        info!(workspace_id = id, "Workspace removed");
        Ok(())
    }

    /// Start a stopped workspace in `env_name`, or its default environment.
    ///
    /// `restore` overrides the workspace's `auto_restore` attribute, which
    /// overrides the engine default. A restore only happens when the
    /// environment has snapshots.
    pub async fn start_workspace(
        &self,
        id: &str,
        env_name: Option<&str>,
        restore: Option<bool>,
    ) -> Result<WorkspaceOperation> {
        require_non_empty(id, "workspace id")?;
        if self.runtimes.is_start_refused() {
            return Err(WsError::conflict(format!(
                "Workspace '{}' can't be started, the system is shutting down",
                id
            )));
        }

        let mut workspace = self.store.get(id).await?;
        let env_name = env_name
            .map(str::to_string)
            .unwrap_or_else(|| workspace.config.default_env.clone());
        workspace.config.environment(&env_name)?;

        let status = self.runtimes.status(id);
        if status != Stopped {
            return Err(WsError::conflict(format!(
                "Could not start workspace '{}' because its status is '{}'",
                workspace.key(),
                status
            )));
        }

        let options = self.start_options(&workspace, &env_name, restore)?;
        for name in [
            attributes::STOPPED,
            attributes::STOPPED_BY,
            attributes::STOP_ERROR,
        ] {
            workspace.attributes.shift_remove(name);
        }
        workspace.stamp(attributes::UPDATED);

        // The record changes only once the start is accepted
        let task = self
            .runtimes
            .prepare_start(&workspace, Some(&env_name), options)
            .await?;
        let mut workspace = match self.store.update(&workspace).await {
            Ok(workspace) => workspace,
            Err(e) => {
                self.runtimes.abort_start(id, &e).await;
                return Err(e);
            }
        };

        let completion = self.dispatch_start(&workspace, task).await?;
        self.runtimes.inject_runtime(&mut workspace).await;
        Ok(WorkspaceOperation {
            workspace,
            completion,
        })
    }

    /// Create a workspace and start it right away.
    ///
    /// A temporary workspace is removed again when the start fails.
    pub async fn start_workspace_from_config(
        &self,
        config: WorkspaceConfig,
        namespace: &str,
        temporary: bool,
        env_name: Option<&str>,
    ) -> Result<WorkspaceOperation> {
        let workspace = self
            .create(config, namespace, IndexMap::new(), temporary)
            .await?;
        match self.start_workspace(&workspace.id, env_name, None).await {
            Ok(operation) => Ok(operation),
            Err(e) => {
                if temporary {
                    self.remove_temporary(&workspace.id).await;
                }
                Err(e)
            }
        }
    }

    fn start_options(
        &self,
        workspace: &Workspace,
        env_name: &str,
        restore: Option<bool>,
    ) -> Result<StartOptions> {
        let restore = restore
            .or_else(|| workspace.attribute_flag(attributes::AUTO_RESTORE))
            .unwrap_or(self.defaults.auto_restore);
        if !restore {
            return Ok(StartOptions::new());
        }

        let snapshots: Vec<Snapshot> = self
            .snapshots
            .find_snapshots(&workspace.id)?
            .into_iter()
            .filter(|snapshot| snapshot.env_name == env_name)
            .collect();
        if snapshots.is_empty() {
            debug!(workspace_id = %workspace.id, env = env_name, "Nothing to restore, starting from the recipe");
            return Ok(StartOptions::new());
        }

        info!(
            workspace_id = %workspace.id,
            env = env_name,
            "Restoring {} machine(s) from snapshot",
            snapshots.len()
        );
        Ok(StartOptions::new().restore_from(snapshots))
    }

    async fn dispatch_start(&self, workspace: &Workspace, task: StartTask) -> Result<TaskHandle<()>> {
        let manager = self.clone();
        let id = workspace.id.clone();
        let temporary = workspace.temporary;
        let run = async move {
            let result = task.run().await;
            if result.is_err() && temporary {
                manager.remove_temporary(&id).await;
            }
            result
        };

        match self.pool.try_submit(run) {
            Ok(handle) => Ok(handle),
            Err(_) => {
                let err = WsError::conflict(format!(
                    "Workspace '{}' can't be started, the task pool is shut down",
                    workspace.id
                ));
                self.runtimes.abort_start(&workspace.id, &err).await;
                if temporary {
                    self.remove_temporary(&workspace.id).await;
                }
                Err(err)
            }
        }
    }

    /// Stop a running or starting workspace.
    ///
    /// `create_snapshot` overrides the workspace's `auto_snapshot` attribute,
    /// which overrides the engine default. Temporary workspaces and workspaces
    /// that are still starting are never snapshotted.
    pub async fn stop_workspace(
        &self,
        id: &str,
        create_snapshot: Option<bool>,
    ) -> Result<TaskHandle<()>> {
        require_non_empty(id, "workspace id")?;
        let workspace = self.store.get(id).await?;
        self.dispatch_stop(workspace, create_snapshot, None).await
    }

    async fn dispatch_stop(
        &self,
        workspace: Workspace,
        create_snapshot: Option<bool>,
        reason: Option<&str>,
    ) -> Result<TaskHandle<()>> {
        let id = workspace.id.clone();
        let stopped_by = Subject::current_name_or("system");
        let mut options = StopOptions::new().stopped_by(&stopped_by);
        if let Some(reason) = reason {
            options = options.with_reason(reason);
        }

        let status = self.runtimes.status(&id);
        match status {
            Starting => match self.defer_stop(&id, &stopped_by, options.clone()).await {
                Ok(handle) => return Ok(handle),
                // Became RUNNING meanwhile
                Err(e) if e.is_conflict() && self.runtimes.status(&id) == Running => {}
                Err(e) => return Err(e),
            },
            Running => {}
            _ => {
                return Err(WsError::conflict(format!(
                    "Could not stop workspace '{}' because its status is '{}'",
                    workspace.key(),
                    status
                )));
            }
        }

        let snapshot = !workspace.temporary
            && create_snapshot
                .or_else(|| workspace.attribute_flag(attributes::AUTO_SNAPSHOT))
                .unwrap_or(self.defaults.auto_snapshot);
        let manager = self.clone();

        if snapshot {
            let runtime = self.runtimes.begin_snapshot(&id).await?;
            return Ok(self.pool.submit_or_detach(async move {
                let error = match manager.snapshot_runtime(&workspace, runtime).await {
                    Ok(_) => None,
                    Err(e) => {
                        warn!(workspace_id = %id, "Snapshot before stop failed: {}", e);
                        Some(e.message())
                    }
                };
                let stop = manager
                    .runtimes
                    .finish_snapshot_then_stop(&id, error, options)
                    .await?;
                let result = stop.run().await;
                manager.after_stop(&id, &stopped_by, &result).await;
                result
            }));
        }

        let stop = self.runtimes.prepare_stop(&id, options).await?;
        Ok(self.pool.submit_or_detach(async move {
            let result = stop.run().await;
            manager.after_stop(&id, &stopped_by, &result).await;
            result
        }))
    }

    /// Queue a stop behind the start or snapshot currently in progress.
    async fn defer_stop(
        &self,
        id: &str,
        stopped_by: &str,
        options: StopOptions,
    ) -> Result<TaskHandle<()>> {
        let stopped = self.runtimes.request_stop(id, options).await?;
        let manager = self.clone();
        let id = id.to_string();
        let stopped_by = stopped_by.to_string();
        Ok(TaskHandle::detached(async move {
            let result = stopped.await;
            manager.after_stop(&id, &stopped_by, &result).await;
            result
        }))
    }

    /// Bring the stored record in line with a completed stop.
    async fn after_stop(&self, id: &str, stopped_by: &str, result: &Result<()>) {
        let mut workspace = match self.store.get(id).await {
            Ok(workspace) => workspace,
            Err(e) => {
                debug!(workspace_id = id, "Stopped workspace is gone from the store: {}", e);
                return;
            }
        };
        if workspace.temporary {
            self.remove_temporary(id).await;
            return;
        }

        workspace.stamp(attributes::STOPPED);
        workspace
            .attributes
            .insert(attributes::STOPPED_BY.to_string(), stopped_by.to_string());
        match result {
            Ok(()) => {
                workspace.attributes.shift_remove(attributes::STOP_ERROR);
            }
            Err(e) => {
                workspace
                    .attributes
                    .insert(attributes::STOP_ERROR.to_string(), e.message());
            }
        }
        if let Err(e) = self.store.update(&workspace).await {
            warn!(workspace_id = id, "Failed to update stopped workspace: {}", e);
        }
    }

    async fn remove_temporary(&self, id: &str) {
        match self.store.remove(id).await {
            Ok(()) => {
                self.purge_snapshots(id);
                self.events.publish(WorkspaceEvent::Removed {
                    workspace_id: id.to_string(),
                });
                info!(workspace_id = id, "Temporary workspace removed");
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(workspace_id = id, "Failed to remove temporary workspace: {}", e),
        }
    }

    /// Snapshot every machine of `runtime`.
    ///
    /// A failure on the dev machine fails the whole snapshot; failures on
    /// other machines are logged and the machine is left out. Snapshots
    /// replace the previous snapshots of the environment.
    async fn snapshot_runtime(
        &self,
        workspace: &Workspace,
        runtime: Arc<dyn InternalRuntime>,
    ) -> Result<Vec<Snapshot>> {
        let env_name = runtime.identity().env_name.clone();
        let mut created = Vec::new();

        for (name, machine) in runtime.machines() {
            let target = Arc::clone(&runtime);
            let machine_name = name.clone();
            let subject = Subject::current();
            let outcome = tokio::task::spawn_blocking(move || {
                subject.sync_scope(|| target.snapshot_machine(&machine_name))
            })
            .await
            .map_err(|e| {
                WsError::internal(format!("Snapshot of machine '{}' didn't complete: {}", name, e))
            })
            .and_then(|result| result);

            match outcome {
                Ok(snapshot) => created.push(snapshot.with_description(format!(
                    "Machine '{}' of workspace '{}'",
                    name,
                    workspace.key()
                ))),
                Err(e) if machine.dev => {
                    self.remove_payloads(created);
                    return Err(e);
                }
                Err(e) => {
                    warn!(workspace_id = %workspace.id, machine = %name, "Leaving machine out of snapshot: {}", e);
                }
            }
        }

        if created.is_empty() {
            return Err(WsError::internal(format!(
                "No machine of workspace '{}' could be snapshotted",
                workspace.id
            )));
        }

        let replaced = match self
            .snapshots
            .replace_snapshots(&workspace.id, &env_name, &created)
        {
            Ok(replaced) => replaced,
            Err(e) => {
                self.remove_payloads(created);
                return Err(e);
            }
        };
        self.remove_payloads(replaced);

        info!(
            workspace_id = %workspace.id,
            env = %env_name,
            "Created {} snapshot(s)",
            created.len()
        );
        Ok(created)
    }

    /// Remove snapshot payloads in the background through their infrastructure.
    fn remove_payloads(&self, snapshots: Vec<Snapshot>) {
        if snapshots.is_empty() {
            return;
        }
        let registry = self.runtimes.infrastructures().clone();
        let submitted = self.pool.execute(async move {
            for snapshot in snapshots {
                let snapshot_id = snapshot.id.clone();
                let infrastructure = match registry.get(&snapshot.recipe_type) {
                    Ok(infrastructure) => infrastructure,
                    Err(e) => {
                        warn!(snapshot_id = %snapshot_id, "Can't remove snapshot payload: {}", e);
                        continue;
                    }
                };
                match tokio::task::spawn_blocking(move || infrastructure.remove_snapshot(&snapshot))
                    .await
                {
                    Ok(Ok(())) => debug!(snapshot_id = %snapshot_id, "Snapshot payload removed"),
                    Ok(Err(e)) => {
                        warn!(snapshot_id = %snapshot_id, "Failed to remove snapshot payload: {}", e)
                    }
                    Err(e) => {
                        warn!(snapshot_id = %snapshot_id, "Removal of snapshot payload didn't complete: {}", e)
                    }
                }
            }
        });
        if let Err(e) = submitted {
            warn!("Snapshot payloads left in place: {}", e);
        }
    }

    /// Remove snapshot metadata one by one, then their payloads. Returns how many were removed.
    fn purge_snapshots(&self, id: &str) -> usize {
        let found = match self.snapshots.find_snapshots(id) {
            Ok(found) => found,
            Err(e) => {
                warn!(workspace_id = id, "Failed to list snapshots: {}", e);
                return 0;
            }
        };

        let mut removed = Vec::with_capacity(found.len());
        for snapshot in found {
            match self.snapshots.remove_snapshot(&snapshot.id) {
                Ok(()) => removed.push(snapshot),
                Err(e) => {
                    warn!(workspace_id = id, snapshot_id = %snapshot.id, "Failed to remove snapshot: {}", e)
                }
            }
        }
        let count = removed.len();
        self.remove_payloads(removed);
        count
    }

    /// Snapshot a running workspace; it stays running.
    pub async fn create_snapshot(&self, id: &str) -> Result<TaskHandle<Vec<Snapshot>>> {
        require_non_empty(id, "workspace id")?;
        let workspace = self.store.get(id).await?;
        let runtime = self.runtimes.begin_snapshot(id).await?;

        let manager = self.clone();
        let task = async move {
            let result = manager.snapshot_runtime(&workspace, runtime).await;
            manager
                .runtimes
                .finish_snapshot(&workspace.id, result.as_ref().err().map(WsError::message))
                .await;
            result
        };

        match self.pool.try_submit(task) {
            Ok(handle) => Ok(handle),
            Err(_) => {
                let err = WsError::conflict(format!(
                    "Workspace '{}' can't be snapshotted, the task pool is shut down",
                    id
                ));
                self.runtimes.finish_snapshot(id, Some(err.message())).await;
                Err(err)
            }
        }
    }

    /// Snapshots of a workspace, newest first.
    pub async fn get_snapshot(&self, id: &str) -> Result<Vec<Snapshot>> {
        require_non_empty(id, "workspace id")?;
        self.store.get(id).await?;
        self.snapshots.find_snapshots(id)
    }

    /// Remove every snapshot of a workspace; failures are logged per snapshot.
    pub async fn remove_snapshots(&self, id: &str) -> Result<()> {
        require_non_empty(id, "workspace id")?;
        self.store.get(id).await?;
        let removed = self.purge_snapshots(id);
        info!(workspace_id = id, "Removed {} snapshot(s)", removed);
        Ok(())
    }

    pub async fn start_machine(
        &self,
        id: &str,
        machine_name: &str,
        config: MachineConfig,
    ) -> Result<TaskHandle<Machine>> {
        require_non_empty(id, "workspace id")?;
        require_non_empty(machine_name, "machine name")?;
        self.runtimes.start_machine(id, machine_name, config).await
    }

    pub async fn stop_machine(&self, id: &str, machine_name: &str) -> Result<TaskHandle<()>> {
        require_non_empty(id, "workspace id")?;
        require_non_empty(machine_name, "machine name")?;
        self.runtimes.stop_machine(id, machine_name).await
    }

    /// Refuse new starts and stop every active workspace, waiting for all of them.
    ///
    /// Only the first call does anything.
    pub async fn shutdown(&self) {
        if !self.runtimes.refuse_start().await {
            debug!("Workspaces are already shut down");
            return;
        }

        let ids = self
            .runtimes
            .ids_with_status(&[Running, Snapshotting, Starting]);
        if ids.is_empty() {
            info!("No active workspaces to stop");
            return;
        }

        info!("Stopping {} active workspace(s)", ids.len());
        let latch = Arc::new(CountDownLatch::new(ids.len()));
        for id in ids {
            let dispatched = match self.store.get(&id).await {
                // A snapshot already in flight is followed by the stop
                Ok(workspace) if self.runtimes.status(&id) == Snapshotting => {
                    let options = StopOptions::new()
                        .stopped_by("system")
                        .with_reason("shutdown");
                    match self.defer_stop(&id, "system", options).await {
                        Err(e) if e.is_conflict() => {
                            self.dispatch_stop(workspace, Some(true), Some("shutdown"))
                                .await
                        }
                        other => other,
                    }
                }
                Ok(workspace) => {
                    self.dispatch_stop(workspace, Some(true), Some("shutdown"))
                        .await
                }
                Err(e) => {
                    warn!(workspace_id = %id, "Stopping runtime of unknown workspace: {}", e);
                    self.runtimes
                        .stop_async(&id, StopOptions::new().with_reason("shutdown"))
                        .await
                }
            };

            let latch = Arc::clone(&latch);
            match dispatched {
                Ok(handle) => {
                    tokio::spawn(async move {
                        if let Err(e) = handle.await {
                            warn!(workspace_id = %id, "Failed to stop workspace on shutdown: {}", e);
                        }
                        latch.count_down();
                    });
                }
                Err(e) => {
                    warn!(workspace_id = %id, "Couldn't stop workspace on shutdown: {}", e);
                    latch.count_down();
                }
            }
        }

        latch.wait().await;
        info!("Active workspaces are stopped");
    }
}

impl std::fmt::Debug for WorkspaceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceManager")
            .field("runtimes", &self.runtimes)
            .field("defaults", &self.defaults)
            .finish()
    }
}
