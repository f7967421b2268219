//! Live workspace runtimes and the lifecycle state machine.
//!
//! `WorkspaceRuntimes` is the only owner of the live runtime map. Every
//! transition of a workspace happens under that workspace's write lock, and
//! the matching status event is published before the lock is released, so
//! subscribers see the transitions of one workspace in the order they were
//! applied:
//!
//! ```text
//! STOPPED -> STARTING -> RUNNING -> STOPPING -> STOPPED
//!                 \-> STOPPED (ERROR event)
//! RUNNING <-> SNAPSHOTTING
//! ```
//!
//! Long operations are split into a synchronous legality phase
//! ([`prepare_start`](WorkspaceRuntimes::prepare_start),
//! [`prepare_stop`](WorkspaceRuntimes::prepare_stop)) and a task that performs
//! the infrastructure call and the closing transition.

use crate::event::{EventBus, EventType};
use crate::lock::KeyedLockTable;
use crate::pool::{TaskHandle, TaskPool};
use crate::status::StatusTable;
use crate::store::WorkspaceStore;
use crate::workspace::{Runtime, Workspace, WorkspaceStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinError;
use tracing::{debug, error, info, info_span, warn, Instrument};
use ws_config::{Environment, MachineConfig};
use ws_core::error::{Result, WsError};
use ws_core::Subject;
use ws_infrastructure::{
    InfrastructureRegistry, InternalRuntime, Machine, RuntimeIdentity, RuntimeInfrastructure,
    StartOptions, StopOptions,
};

use WorkspaceStatus::{Running, Snapshotting, Starting, Stopped, Stopping};

type StopWaiter = oneshot::Sender<Result<()>>;

/// Stop requested while the workspace was starting or snapshotting.
struct PendingStop {
    options: StopOptions,
    waiter: StopWaiter,
}

pub struct WorkspaceRuntimes {
    infrastructures: InfrastructureRegistry,
    events: Arc<EventBus>,
    locks: Arc<KeyedLockTable>,
    pool: Arc<TaskPool>,
    statuses: StatusTable,
    runtimes: RwLock<HashMap<String, Arc<dyn InternalRuntime>>>,
    pending_stops: Mutex<HashMap<String, PendingStop>>,
    refuse_start: AtomicBool,
}

impl WorkspaceRuntimes {
    pub fn new(
        infrastructures: InfrastructureRegistry,
        events: Arc<EventBus>,
        locks: Arc<KeyedLockTable>,
        pool: Arc<TaskPool>,
    ) -> Self {
        Self {
            infrastructures,
            events,
            locks,
            pool,
            statuses: StatusTable::new(),
            runtimes: RwLock::new(HashMap::new()),
            pending_stops: Mutex::new(HashMap::new()),
            refuse_start: AtomicBool::new(false),
        }
    }

    pub fn infrastructures(&self) -> &InfrastructureRegistry {
        &self.infrastructures
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Let the infrastructure for the environment's recipe validate it.
    pub fn validate(&self, environment: &Environment) -> Result<Environment> {
        self.infrastructures.estimate(environment)
    }

    fn live(&self, id: &str) -> Option<Arc<dyn InternalRuntime>> {
        self.runtimes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn insert_live(&self, id: &str, runtime: Arc<dyn InternalRuntime>) {
        self.runtimes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), runtime);
    }

    fn remove_live(&self, id: &str) -> Option<Arc<dyn InternalRuntime>> {
        self.runtimes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingStop>> {
        self.pending_stops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn take_pending_stop(&self, id: &str) -> Option<PendingStop> {
        self.pending().remove(id)
    }

    pub fn status(&self, id: &str) -> WorkspaceStatus {
        self.statuses.get(id)
    }

    pub fn has_runtime(&self, id: &str) -> bool {
        self.runtimes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// Copy of the live runtime of `id`; later changes don't show up in it.
    pub async fn get(&self, id: &str) -> Result<Runtime> {
        let lock = self.locks.read_lock(id).await;
        let runtime = self.live(id).ok_or_else(|| no_runtime(id))?;
        let copy = Runtime::from_internal(runtime.as_ref());
        lock.unlock();
        Ok(copy)
    }

    /// Overlay the live status and runtime onto a stored workspace.
    pub async fn inject_runtime(&self, workspace: &mut Workspace) {
        let lock = self.locks.read_lock(&workspace.id).await;
        workspace.status = self.statuses.get(&workspace.id);
        workspace.runtime = self
            .live(&workspace.id)
            .map(|runtime| Runtime::from_internal(runtime.as_ref()));
        lock.unlock();
    }

    /// Overlay only the live status.
    pub fn inject_status(&self, workspace: &mut Workspace) {
        workspace.status = self.statuses.get(&workspace.id);
    }

    /// Ids of workspaces with a live runtime, sorted.
    pub fn runtime_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .runtimes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Whether any workspace is outside the `STOPPED` rest state.
    pub fn is_any_running(&self) -> bool {
        !self.statuses.is_empty()
    }

    pub fn ids_with_status(&self, statuses: &[WorkspaceStatus]) -> Vec<String> {
        self.statuses.ids_with(statuses)
    }

    /// Refuse every later start. Returns `true` only for the first call.
    pub async fn refuse_start(&self) -> bool {
        let all = self.locks.write_all_lock().await;
        let first = !self.refuse_start.swap(true, Ordering::SeqCst);
        all.unlock();
        first
    }

    pub fn is_start_refused(&self) -> bool {
        self.refuse_start.load(Ordering::SeqCst)
    }

    /// Check that `workspace` may start and mark it `STARTING`.
    ///
    /// Fails with `NotFound` for an unknown environment or recipe type and with
    /// `Conflict` when the workspace isn't stopped or starts are refused.
    pub async fn prepare_start(
        self: &Arc<Self>,
        workspace: &Workspace,
        env_name: Option<&str>,
        options: StartOptions,
    ) -> Result<StartTask> {
        let env_name = env_name.unwrap_or(&workspace.config.default_env);
        let environment = workspace.config.environment(env_name)?.clone();
        let infrastructure = self
            .infrastructures
            .get(&environment.recipe.recipe_type)?;

        let subject = Subject::current();
        let owner_id = if subject.anonymous {
            workspace.owner_id.clone()
        } else {
            subject.user_id
        };
        let identity = RuntimeIdentity::new(&workspace.id, env_name, owner_id);

        let lock = self.locks.write_lock(&workspace.id).await;
        if self.is_start_refused() {
            return Err(WsError::conflict(format!(
                "Workspace '{}' can't be started, the system is shutting down",
                workspace.id
            )));
        }
        if self.has_runtime(&workspace.id)
            || !self
                .statuses
                .compare_and_set(&workspace.id, Stopped, Starting)
        {
            return Err(WsError::conflict(format!(
                "Could not start workspace '{}' because its status is '{}'",
                workspace.key(),
                self.statuses.get(&workspace.id)
            )));
        }
        self.events
            .publish_status(&workspace.id, Stopped, Starting, EventType::Starting, None);
        lock.unlock();

        info!(
            workspace_id = %workspace.id,
            env = env_name,
            infrastructure = infrastructure.name(),
            "Starting workspace '{}'",
            workspace.key()
        );
        Ok(StartTask {
            runtimes: Arc::clone(self),
            identity,
            environment,
            infrastructure,
            options,
        })
    }

    /// Prepare the start and run it in the pool.
    pub async fn start_async(
        self: &Arc<Self>,
        workspace: &Workspace,
        env_name: Option<&str>,
        options: StartOptions,
    ) -> Result<TaskHandle<()>> {
        let task = self.prepare_start(workspace, env_name, options).await?;
        match self.pool.try_submit(task.run()) {
            Ok(handle) => Ok(handle),
            Err(_) => {
                let err = WsError::conflict(format!(
                    "Workspace '{}' can't be started, the task pool is shut down",
                    workspace.id
                ));
                self.abort_start(&workspace.id, &err).await;
                Err(err)
            }
        }
    }

    /// Start and wait for the outcome.
    pub async fn start(
        self: &Arc<Self>,
        workspace: &Workspace,
        env_name: Option<&str>,
        options: StartOptions,
    ) -> Result<()> {
        self.start_async(workspace, env_name, options).await?.await
    }

    /// Roll a prepared start back to `STOPPED` without running it.
    pub async fn abort_start(&self, id: &str, err: &WsError) {
        let lock = self.locks.write_lock(id).await;
        if self.statuses.compare_and_set(id, Starting, Stopped) {
            self.events
                .publish_status(id, Starting, Stopped, EventType::Error, Some(err.message()));
        }
        let pending = self.take_pending_stop(id);
        lock.unlock();
        if let Some(pending) = pending {
            let _ = pending.waiter.send(Ok(()));
        }
    }

    async fn finish_start(
        self: &Arc<Self>,
        identity: &RuntimeIdentity,
        result: Result<Arc<dyn InternalRuntime>>,
    ) -> Result<()> {
        let id = identity.workspace_id.as_str();
        let lock = self.locks.write_lock(id).await;
        let pending = self.take_pending_stop(id);
        match result {
            Ok(runtime) => {
                self.insert_live(id, runtime);
                self.statuses.set(id, Running);
                self.events
                    .publish_status(id, Starting, Running, EventType::Running, None);
                info!("Workspace started");

                let Some(pending) = pending else {
                    lock.unlock();
                    return Ok(());
                };
                let stop = self.begin_stop_locked(id, pending.options);
                lock.unlock();
                run_deferred_stop(stop, pending.waiter).await;
                Ok(())
            }
            Err(err) => {
                self.statuses.remove(id);
                self.events.publish_status(
                    id,
                    Starting,
                    Stopped,
                    EventType::Error,
                    Some(err.message()),
                );
                lock.unlock();

                if err.is_user_facing() {
                    warn!("Failed to start workspace: {}", err);
                } else {
                    error!("Failed to start workspace: {}", err);
                }
                if let Some(pending) = pending {
                    let _ = pending.waiter.send(Ok(()));
                }
                Err(err)
            }
        }
    }

    /// Move a running workspace to `STOPPING`. The caller holds the write lock.
    fn begin_stop_locked(self: &Arc<Self>, id: &str, options: StopOptions) -> Result<StopTask> {
        let runtime = self.live(id).ok_or_else(|| no_runtime(id))?;
        let status = self.statuses.get(id);
        if status != Running {
            return Err(WsError::conflict(format!(
                "Could not stop workspace '{}' because its status is '{}'",
                id, status
            )));
        }
        self.statuses.set(id, Stopping);
        self.events
            .publish_status(id, Running, Stopping, EventType::Stopping, None);
        Ok(StopTask {
            runtimes: Arc::clone(self),
            workspace_id: id.to_string(),
            runtime,
            options,
            waiter: None,
        })
    }

    /// Check that the workspace may stop and mark it `STOPPING`.
    ///
    /// Fails with `NotFound` when it has no live runtime and with `Conflict`
    /// when it isn't running.
    pub async fn prepare_stop(self: &Arc<Self>, id: &str, options: StopOptions) -> Result<StopTask> {
        let lock = self.locks.write_lock(id).await;
        let task = self.begin_stop_locked(id, options);
        lock.unlock();
        task
    }

    /// Prepare the stop and run it in the pool.
    pub async fn stop_async(
        self: &Arc<Self>,
        id: &str,
        options: StopOptions,
    ) -> Result<TaskHandle<()>> {
        let task = self.prepare_stop(id, options).await?;
        Ok(self.pool.submit_or_detach(task.run()))
    }

    /// Stop and wait for the outcome.
    pub async fn stop(self: &Arc<Self>, id: &str, options: StopOptions) -> Result<()> {
        self.stop_async(id, options).await?.await
    }

    async fn finish_stop(&self, id: &str, result: &Result<()>) {
        let lock = self.locks.write_lock(id).await;
        self.remove_live(id);
        self.statuses.remove(id);
        self.events.publish_status(
            id,
            Stopping,
            Stopped,
            EventType::Stopped,
            result.as_ref().err().map(WsError::message),
        );
        lock.unlock();

        match result {
            Ok(()) => info!("Workspace stopped"),
            Err(e) => warn!("Workspace stopped with error: {}", e),
        }
    }

    /// Stop a workspace once it leaves `STARTING` or `SNAPSHOTTING`.
    ///
    /// The returned handle resolves when the stop completes, or right away
    /// with `Ok` if the start fails.
    pub async fn request_stop(
        self: &Arc<Self>,
        id: &str,
        options: StopOptions,
    ) -> Result<TaskHandle<()>> {
        let lock = self.locks.write_lock(id).await;
        let status = self.statuses.get(id);
        if !matches!(status, Starting | Snapshotting) {
            return Err(WsError::conflict(format!(
                "Stop of workspace '{}' can't be deferred because its status is '{}'",
                id, status
            )));
        }

        let mut pending = self.pending();
        if pending.contains_key(id) {
            return Err(WsError::conflict(format!(
                "Stop of workspace '{}' is already requested",
                id
            )));
        }
        let (waiter, handle) = TaskHandle::channel();
        pending.insert(id.to_string(), PendingStop { options, waiter });
        drop(pending);
        lock.unlock();

        debug!(workspace_id = id, "Stop deferred while workspace is {}", status);
        Ok(handle)
    }

    /// Mark a running workspace `SNAPSHOTTING` and hand out its runtime.
    pub async fn begin_snapshot(&self, id: &str) -> Result<Arc<dyn InternalRuntime>> {
        let lock = self.locks.write_lock(id).await;
        let runtime = self.live(id).ok_or_else(|| no_runtime(id))?;
        let status = self.statuses.get(id);
        if status != Running {
            return Err(WsError::conflict(format!(
                "Could not snapshot workspace '{}' because its status is '{}'",
                id, status
            )));
        }
        self.statuses.set(id, Snapshotting);
        self.events.publish_status(
            id,
            Running,
            Snapshotting,
            EventType::SnapshotCreating,
            None,
        );
        lock.unlock();
        Ok(runtime)
    }

    fn finish_snapshot_locked(&self, id: &str, error: Option<String>) -> bool {
        if !self.statuses.compare_and_set(id, Snapshotting, Running) {
            return false;
        }
        let event_type = if error.is_some() {
            EventType::SnapshotCreationError
        } else {
            EventType::SnapshotCreated
        };
        self.events
            .publish_status(id, Snapshotting, Running, event_type, error);
        true
    }

    /// Return a snapshotting workspace to `RUNNING`, then run a stop requested meanwhile.
    pub async fn finish_snapshot(self: &Arc<Self>, id: &str, error: Option<String>) {
        let lock = self.locks.write_lock(id).await;
        self.finish_snapshot_locked(id, error);
        let deferred = self
            .take_pending_stop(id)
            .map(|pending| (self.begin_stop_locked(id, pending.options), pending.waiter));
        lock.unlock();

        if let Some((stop, waiter)) = deferred {
            run_deferred_stop(stop, waiter).await;
        }
    }

    /// Finish a snapshot and move straight to `STOPPING` under one lock.
    pub async fn finish_snapshot_then_stop(
        self: &Arc<Self>,
        id: &str,
        error: Option<String>,
        options: StopOptions,
    ) -> Result<StopTask> {
        let lock = self.locks.write_lock(id).await;
        self.finish_snapshot_locked(id, error);
        let mut task = self.begin_stop_locked(id, options)?;
        task.waiter = self.take_pending_stop(id).map(|pending| pending.waiter);
        lock.unlock();
        Ok(task)
    }

    fn running_runtime(&self, id: &str) -> Result<Arc<dyn InternalRuntime>> {
        let status = self.statuses.get(id);
        if status != Running {
            return Err(WsError::conflict(format!(
                "Workspace '{}' is not running, its status is '{}'",
                id, status
            )));
        }
        self.live(id).ok_or_else(|| no_runtime(id))
    }

    /// Add a machine to a running workspace.
    pub async fn start_machine(
        &self,
        id: &str,
        machine_name: &str,
        config: MachineConfig,
    ) -> Result<TaskHandle<Machine>> {
        let lock = self.locks.read_lock(id).await;
        let runtime = self.running_runtime(id)?;
        lock.unlock();

        let span = info_span!("start_machine", workspace_id = %id, machine = %machine_name);
        let name = machine_name.to_string();
        self.pool.submit(
            async move {
                let subject = Subject::current();
                tokio::task::spawn_blocking(move || {
                    subject.sync_scope(|| runtime.start_machine(&name, &config))
                })
                .await
                .map_err(join_error)?
            }
            .instrument(span),
        )
    }

    /// Stop one machine of a running workspace; the dev machine can't be stopped.
    pub async fn stop_machine(&self, id: &str, machine_name: &str) -> Result<TaskHandle<()>> {
        let lock = self.locks.read_lock(id).await;
        let runtime = self.running_runtime(id)?;
        lock.unlock();

        if runtime
            .dev_machine()
            .is_some_and(|machine| machine.name == machine_name)
        {
            return Err(WsError::conflict(format!(
                "Machine '{}' is the dev machine of workspace '{}' and can't be stopped",
                machine_name, id
            )));
        }

        let span = info_span!("stop_machine", workspace_id = %id, machine = %machine_name);
        let name = machine_name.to_string();
        self.pool.submit(
            async move {
                let subject = Subject::current();
                tokio::task::spawn_blocking(move || subject.sync_scope(|| runtime.stop_machine(&name)))
                    .await
                    .map_err(join_error)?
            }
            .instrument(span),
        )
    }

    /// Drop the runtime of a workspace its infrastructure lost.
    ///
    /// Returns `false` when the workspace has no live runtime.
    pub async fn handle_abnormal_stop(&self, id: &str, error: &str) -> bool {
        let lock = self.locks.write_lock(id).await;
        if self.remove_live(id).is_none() {
            return false;
        }
        let previous = self.statuses.remove(id);
        let pending = self.take_pending_stop(id);
        self.events.publish_status(
            id,
            previous,
            Stopped,
            EventType::Error,
            Some(error.to_string()),
        );
        lock.unlock();

        warn!(workspace_id = id, "Workspace stopped abnormally: {}", error);
        if let Some(pending) = pending {
            let _ = pending.waiter.send(Ok(()));
        }
        true
    }

    /// Adopt runtimes that infrastructures report as already running.
    ///
    /// Runtimes of unknown workspaces or environments are skipped. Returns the
    /// number of adopted runtimes.
    pub async fn recover(&self, store: &dyn WorkspaceStore) -> usize {
        let mut recovered = 0;
        for (infrastructure, identity) in self.infrastructures.recoverable_identities() {
            let id = identity.workspace_id.clone();
            let workspace = match store.get(&id).await {
                Ok(workspace) => workspace,
                Err(e) => {
                    warn!(workspace_id = %id, "Skipping recovery of runtime {}: {}", identity, e);
                    continue;
                }
            };
            if let Err(e) = workspace.config.environment(&identity.env_name) {
                warn!(workspace_id = %id, "Skipping recovery of runtime {}: {}", identity, e);
                continue;
            }

            let lookup = identity.clone();
            let runtime = match tokio::task::spawn_blocking(move || infrastructure.runtime(&lookup))
                .await
                .map_err(join_error)
                .and_then(|result| result)
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    warn!(workspace_id = %id, "Couldn't recover runtime {}: {}", identity, e);
                    continue;
                }
            };

            let lock = self.locks.write_lock(&id).await;
            if self.has_runtime(&id) || self.statuses.get(&id) != Stopped {
                lock.unlock();
                warn!(workspace_id = %id, "Runtime {} is already registered, skipping", identity);
                continue;
            }
            self.insert_live(&id, runtime);
            self.statuses.set(&id, Running);
            lock.unlock();

            info!(workspace_id = %id, env = %identity.env_name, "Recovered runtime of workspace '{}'", workspace.key());
            recovered += 1;
        }
        recovered
    }
}

impl std::fmt::Debug for WorkspaceRuntimes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceRuntimes")
            .field("runtimes", &self.runtime_ids())
            .field("refuse_start", &self.is_start_refused())
            .finish()
    }
}

/// Start phase of a workspace, ready to run.
#[must_use = "the workspace stays STARTING until the task is run"]
pub struct StartTask {
    runtimes: Arc<WorkspaceRuntimes>,
    identity: RuntimeIdentity,
    environment: Environment,
    infrastructure: Arc<dyn RuntimeInfrastructure>,
    options: StartOptions,
}

impl StartTask {
    pub fn identity(&self) -> &RuntimeIdentity {
        &self.identity
    }

    /// Start the runtime and apply the closing transition.
    pub async fn run(self) -> Result<()> {
        let StartTask {
            runtimes,
            identity,
            environment,
            infrastructure,
            options,
        } = self;
        let span = info_span!(
            "start",
            workspace_id = %identity.workspace_id,
            env = %identity.env_name,
            infrastructure = %infrastructure.name()
        );

        async move {
            let subject = Subject::current();
            let target = identity.clone();
            let result = tokio::task::spawn_blocking(move || {
                subject.sync_scope(|| {
                    start_runtime(infrastructure.as_ref(), &target, &environment, &options)
                })
            })
            .await
            .map_err(join_error)
            .and_then(|result| result);

            runtimes.finish_start(&identity, result).await
        }
        .instrument(span)
        .await
    }
}

/// Stop phase of a workspace, ready to run.
#[must_use = "the workspace stays STOPPING until the task is run"]
pub struct StopTask {
    runtimes: Arc<WorkspaceRuntimes>,
    workspace_id: String,
    runtime: Arc<dyn InternalRuntime>,
    options: StopOptions,
    waiter: Option<StopWaiter>,
}

impl StopTask {
    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// Stop the runtime and apply the closing transition.
    ///
    /// The runtime is dropped from the registry whatever the outcome.
    pub async fn run(self) -> Result<()> {
        let StopTask {
            runtimes,
            workspace_id,
            runtime,
            options,
            waiter,
        } = self;
        let span = info_span!("stop", workspace_id = %workspace_id);

        async move {
            let subject = Subject::current();
            let result = tokio::task::spawn_blocking(move || {
                subject.sync_scope(|| runtime.stop(&options))
            })
            .await
            .map_err(join_error)
            .and_then(|result| result);

            runtimes.finish_stop(&workspace_id, &result).await;
            if let Some(waiter) = waiter {
                let _ = waiter.send(copy_result(&result));
            }
            result
        }
        .instrument(span)
        .await
    }
}

fn start_runtime(
    infrastructure: &dyn RuntimeInfrastructure,
    identity: &RuntimeIdentity,
    environment: &Environment,
    options: &StartOptions,
) -> Result<Arc<dyn InternalRuntime>> {
    let runtime = infrastructure
        .prepare(identity, environment)?
        .start(options)?;
    if runtime.machines().is_empty() {
        if let Err(e) = runtime.stop(&StopOptions::new().with_reason("runtime has no machines")) {
            warn!("Failed to stop runtime without machines: {}", e);
        }
        return Err(WsError::internal(format!(
            "Infrastructure '{}' started runtime {} without machines",
            infrastructure.name(),
            identity
        )));
    }
    Ok(runtime)
}

async fn run_deferred_stop(stop: Result<StopTask>, waiter: StopWaiter) {
    match stop {
        Ok(mut task) => {
            task.waiter = Some(waiter);
            if let Err(e) = task.run().await {
                warn!("Deferred stop failed: {}", e);
            }
        }
        Err(e) => {
            let _ = waiter.send(Err(e));
        }
    }
}

fn no_runtime(id: &str) -> WsError {
    WsError::not_found(format!("Workspace '{}' has no running runtime", id))
}

fn join_error(err: JoinError) -> WsError {
    WsError::internal(format!("Infrastructure call didn't complete: {err}"))
}

fn copy_result(result: &Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) => Err(match err {
            WsError::NotFound(m) => WsError::NotFound(m.clone()),
            WsError::Conflict(m) => WsError::Conflict(m.clone()),
            WsError::BadRequest(m) => WsError::BadRequest(m.clone()),
            WsError::Validation(m) => WsError::Validation(m.clone()),
            WsError::Infrastructure(m) => WsError::Infrastructure(m.clone()),
            WsError::NotSupported(m) => WsError::NotSupported(m.clone()),
            WsError::Internal(m) => WsError::Internal(m.clone()),
            WsError::Server(m) => WsError::Server(m.clone()),
            other => WsError::server(other.message()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::WorkspaceEvent;
    use crate::store::MemoryWorkspaceStore;
    use crate::test_utils::{sample_config, SAMPLE_DEV_MACHINE};
    use std::time::{Duration, Instant};
    use ws_config::PoolConfig;
    use ws_infrastructure::mock::FakeInfrastructure;
    use ws_infrastructure::MachineStatus;

    type Seen = Arc<Mutex<Vec<(EventType, WorkspaceStatus, Option<String>)>>>;

    fn runtimes_with(fake: &Arc<FakeInfrastructure>) -> Arc<WorkspaceRuntimes> {
        let registry =
            InfrastructureRegistry::new(vec![fake.clone() as Arc<dyn RuntimeInfrastructure>]);
        Arc::new(WorkspaceRuntimes::new(
            registry,
            Arc::new(EventBus::new()),
            Arc::new(KeyedLockTable::default()),
            Arc::new(TaskPool::new(&PoolConfig::cached())),
        ))
    }

    fn record(runtimes: &WorkspaceRuntimes) -> Seen {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        runtimes.events().subscribe(move |event| {
            if let WorkspaceEvent::StatusChanged(change) = event {
                sink.lock().unwrap().push((
                    change.event_type,
                    change.status,
                    change.error.clone(),
                ));
            }
        });
        seen
    }

    fn types(seen: &Seen) -> Vec<EventType> {
        seen.lock().unwrap().iter().map(|(t, _, _)| *t).collect()
    }

    fn workspace() -> Workspace {
        Workspace::new(sample_config("dev", "fake"), "alice", "user-alice")
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let fake = Arc::new(FakeInfrastructure::new("fake"));
        let runtimes = runtimes_with(&fake);
        let seen = record(&runtimes);
        let ws = workspace();

        runtimes.start(&ws, None, StartOptions::new()).await.unwrap();
        assert!(runtimes.has_runtime(&ws.id));
        assert_eq!(runtimes.status(&ws.id), Running);
        assert_eq!(runtimes.runtime_ids(), vec![ws.id.clone()]);

        runtimes.stop(&ws.id, StopOptions::new()).await.unwrap();
        assert!(!runtimes.has_runtime(&ws.id));
        assert_eq!(runtimes.status(&ws.id), Stopped);
        assert!(!runtimes.is_any_running());
        assert_eq!(
            types(&seen),
            vec![
                EventType::Starting,
                EventType::Running,
                EventType::Stopping,
                EventType::Stopped
            ]
        );
        assert_eq!(fake.stopped_count(), 1);
    }

    #[tokio::test]
    async fn test_owner_comes_from_subject() {
        let fake = Arc::new(FakeInfrastructure::new("fake"));
        let runtimes = runtimes_with(&fake);
        let ws = workspace();

        Subject::new("user-bob", "bob")
            .scope(runtimes.start(&ws, None, StartOptions::new()))
            .await
            .unwrap();
        assert_eq!(runtimes.get(&ws.id).await.unwrap().owner_id, "user-bob");
    }

    #[tokio::test]
    async fn test_double_start_conflicts_without_events() {
        let fake = Arc::new(FakeInfrastructure::new("fake"));
        let runtimes = runtimes_with(&fake);
        let ws = workspace();
        runtimes.start(&ws, None, StartOptions::new()).await.unwrap();

        let seen = record(&runtimes);
        let err = runtimes
            .start(&ws, None, StartOptions::new())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(fake.started_count(), 1);
        assert_eq!(runtimes.status(&ws.id), Running);
    }

    #[tokio::test]
    async fn test_stop_without_runtime_is_not_found_without_events() {
        let fake = Arc::new(FakeInfrastructure::new("fake"));
        let runtimes = runtimes_with(&fake);
        let seen = record(&runtimes);

        let err = runtimes
            .stop("workspace-missing", StopOptions::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_recipe_type_is_not_found() {
        let fake = Arc::new(FakeInfrastructure::new("other"));
        let runtimes = runtimes_with(&fake);
        let seen = record(&runtimes);

        let err = runtimes
            .start(&workspace(), None, StartOptions::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_start_rolls_back() {
        let fake = Arc::new(FakeInfrastructure::new("fake").failing_start("boom"));
        let runtimes = runtimes_with(&fake);
        let seen = record(&runtimes);
        let ws = workspace();

        let err = runtimes
            .start(&ws, None, StartOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.message(), "boom");
        assert!(!runtimes.has_runtime(&ws.id));
        assert_eq!(runtimes.status(&ws.id), Stopped);

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, EventType::Starting);
        assert_eq!(
            seen[1],
            (EventType::Error, Stopped, Some("boom".to_string()))
        );
    }

    #[tokio::test]
    async fn test_runtime_without_machines_is_rejected() {
        let fake = Arc::new(FakeInfrastructure::new("fake").returning_empty_runtimes());
        let runtimes = runtimes_with(&fake);
        let ws = workspace();

        let err = runtimes
            .start(&ws, None, StartOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WsError::Internal(_)));
        assert!(!runtimes.has_runtime(&ws.id));
    }

    #[tokio::test]
    async fn test_runtime_becomes_visible_only_when_running() {
        let fake = Arc::new(
            FakeInfrastructure::new("fake").with_start_delay(Duration::from_millis(200)),
        );
        let runtimes = runtimes_with(&fake);
        let ws = workspace();

        let handle = runtimes
            .start_async(&ws, None, StartOptions::new())
            .await
            .unwrap();
        assert_eq!(runtimes.status(&ws.id), Starting);
        assert!(!runtimes.has_runtime(&ws.id));
        assert!(runtimes.get(&ws.id).await.unwrap_err().is_not_found());

        handle.await.unwrap();
        assert!(runtimes.has_runtime(&ws.id));
    }

    #[tokio::test]
    async fn test_get_returns_a_copy() {
        let fake = Arc::new(FakeInfrastructure::new("fake"));
        let runtimes = runtimes_with(&fake);
        let ws = workspace();
        runtimes.start(&ws, None, StartOptions::new()).await.unwrap();

        let before = runtimes.get(&ws.id).await.unwrap();
        fake.live_runtime(&ws.id)
            .unwrap()
            .set_machine_status(SAMPLE_DEV_MACHINE, MachineStatus::Failed);
        let after = runtimes.get(&ws.id).await.unwrap();

        assert_eq!(before.machines[SAMPLE_DEV_MACHINE].status, MachineStatus::Running);
        assert_eq!(after.machines[SAMPLE_DEV_MACHINE].status, MachineStatus::Failed);
        assert_eq!(after.active_env, "main");
    }

    #[tokio::test]
    async fn test_failed_stop_still_removes_runtime() {
        let fake = Arc::new(FakeInfrastructure::new("fake").failing_stop("stuck"));
        let runtimes = runtimes_with(&fake);
        let seen = record(&runtimes);
        let ws = workspace();
        runtimes.start(&ws, None, StartOptions::new()).await.unwrap();

        let err = runtimes.stop(&ws.id, StopOptions::new()).await.unwrap_err();
        assert_eq!(err.message(), "stuck");
        assert!(!runtimes.has_runtime(&ws.id));
        assert_eq!(
            seen.lock().unwrap().last().cloned(),
            Some((EventType::Stopped, Stopped, Some("stuck".to_string())))
        );
    }

    #[tokio::test]
    async fn test_stop_requested_while_starting() {
        let fake = Arc::new(
            FakeInfrastructure::new("fake").with_start_delay(Duration::from_millis(200)),
        );
        let runtimes = runtimes_with(&fake);
        let seen = record(&runtimes);
        let ws = workspace();

        let start = runtimes
            .start_async(&ws, None, StartOptions::new())
            .await
            .unwrap();
        let stop = runtimes
            .request_stop(&ws.id, StopOptions::new())
            .await
            .unwrap();
        assert!(runtimes
            .request_stop(&ws.id, StopOptions::new())
            .await
            .unwrap_err()
            .is_conflict());

        start.await.unwrap();
        stop.await.unwrap();
        assert!(!runtimes.has_runtime(&ws.id));
        assert_eq!(
            types(&seen),
            vec![
                EventType::Starting,
                EventType::Running,
                EventType::Stopping,
                EventType::Stopped
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_requested_while_starting_resolves_on_failure() {
        let fake = Arc::new(
            FakeInfrastructure::new("fake")
                .with_start_delay(Duration::from_millis(100))
                .failing_start("boom"),
        );
        let runtimes = runtimes_with(&fake);
        let ws = workspace();

        let start = runtimes
            .start_async(&ws, None, StartOptions::new())
            .await
            .unwrap();
        let stop = runtimes
            .request_stop(&ws.id, StopOptions::new())
            .await
            .unwrap();
        assert!(start.await.is_err());
        stop.await.unwrap();
        assert_eq!(fake.stopped_count(), 0);
    }

    #[tokio::test]
    async fn test_request_stop_requires_transient_status() {
        let fake = Arc::new(FakeInfrastructure::new("fake"));
        let runtimes = runtimes_with(&fake);
        let ws = workspace();
        runtimes.start(&ws, None, StartOptions::new()).await.unwrap();

        assert!(runtimes
            .request_stop(&ws.id, StopOptions::new())
            .await
            .unwrap_err()
            .is_conflict());
    }

    #[tokio::test]
    async fn test_distinct_workspaces_start_concurrently() {
        let delay = Duration::from_millis(300);
        let fake = Arc::new(FakeInfrastructure::new("fake").with_start_delay(delay));
        let runtimes = runtimes_with(&fake);
        let workspaces: Vec<Workspace> = (0..4)
            .map(|i| {
                Workspace::new(sample_config(&format!("dev{i}"), "fake"), "alice", "user-alice")
            })
            .collect();

        let started = Instant::now();
        let mut handles = Vec::new();
        for ws in &workspaces {
            handles.push(
                runtimes
                    .start_async(ws, None, StartOptions::new())
                    .await
                    .unwrap(),
            );
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(started.elapsed() < delay * 3);
        assert_eq!(runtimes.runtime_ids().len(), 4);
    }

    #[tokio::test]
    async fn test_snapshot_overlay() {
        let fake = Arc::new(FakeInfrastructure::new("fake"));
        let runtimes = runtimes_with(&fake);
        let seen = record(&runtimes);
        let ws = workspace();
        runtimes.start(&ws, None, StartOptions::new()).await.unwrap();

        runtimes.begin_snapshot(&ws.id).await.unwrap();
        assert_eq!(runtimes.status(&ws.id), Snapshotting);
        assert!(runtimes.begin_snapshot(&ws.id).await.err().unwrap().is_conflict());
        assert!(runtimes
            .stop(&ws.id, StopOptions::new())
            .await
            .unwrap_err()
            .is_conflict());

        runtimes
            .finish_snapshot(&ws.id, Some("disk full".to_string()))
            .await;
        assert_eq!(runtimes.status(&ws.id), Running);
        assert_eq!(
            seen.lock().unwrap().last().cloned(),
            Some((
                EventType::SnapshotCreationError,
                Running,
                Some("disk full".to_string())
            ))
        );
    }

    #[tokio::test]
    async fn test_snapshot_then_stop() {
        let fake = Arc::new(FakeInfrastructure::new("fake"));
        let runtimes = runtimes_with(&fake);
        let seen = record(&runtimes);
        let ws = workspace();
        runtimes.start(&ws, None, StartOptions::new()).await.unwrap();

        runtimes.begin_snapshot(&ws.id).await.unwrap();
        let stop = runtimes
            .finish_snapshot_then_stop(&ws.id, None, StopOptions::new())
            .await
            .unwrap();
        assert_eq!(stop.workspace_id(), ws.id);
        stop.run().await.unwrap();

        assert_eq!(
            types(&seen),
            vec![
                EventType::Starting,
                EventType::Running,
                EventType::SnapshotCreating,
                EventType::SnapshotCreated,
                EventType::Stopping,
                EventType::Stopped
            ]
        );
    }

    #[tokio::test]
    async fn test_machine_operations() {
        let fake = Arc::new(FakeInfrastructure::new("fake"));
        let runtimes = runtimes_with(&fake);
        let ws = workspace();

        assert!(runtimes
            .start_machine(&ws.id, "db", MachineConfig::default())
            .await
            .unwrap_err()
            .is_conflict());

        runtimes.start(&ws, None, StartOptions::new()).await.unwrap();
        let machine = runtimes
            .start_machine(&ws.id, "db", MachineConfig::default())
            .await
            .unwrap()
            .await
            .unwrap();
        assert_eq!(machine.name, "db");
        assert!(runtimes.get(&ws.id).await.unwrap().machines.contains_key("db"));

        assert!(runtimes
            .stop_machine(&ws.id, SAMPLE_DEV_MACHINE)
            .await
            .unwrap_err()
            .is_conflict());
        runtimes
            .stop_machine(&ws.id, "db")
            .await
            .unwrap()
            .await
            .unwrap();
        assert!(!runtimes.get(&ws.id).await.unwrap().machines.contains_key("db"));
    }

    #[tokio::test]
    async fn test_abnormal_stop() {
        let fake = Arc::new(FakeInfrastructure::new("fake"));
        let runtimes = runtimes_with(&fake);
        let seen = record(&runtimes);
        let ws = workspace();
        runtimes.start(&ws, None, StartOptions::new()).await.unwrap();

        assert!(runtimes.handle_abnormal_stop(&ws.id, "host lost").await);
        assert!(!runtimes.handle_abnormal_stop(&ws.id, "host lost").await);
        assert!(!runtimes.has_runtime(&ws.id));
        assert_eq!(
            seen.lock().unwrap().last().cloned(),
            Some((EventType::Error, Stopped, Some("host lost".to_string())))
        );
    }

    #[tokio::test]
    async fn test_refuse_start_is_one_shot() {
        let fake = Arc::new(FakeInfrastructure::new("fake"));
        let runtimes = runtimes_with(&fake);

        assert!(runtimes.refuse_start().await);
        assert!(!runtimes.refuse_start().await);
        assert!(runtimes
            .start(&workspace(), None, StartOptions::new())
            .await
            .unwrap_err()
            .is_conflict());
        assert_eq!(fake.prepared_count(), 0);
    }

    #[tokio::test]
    async fn test_recover_adopts_known_runtimes() {
        let store = MemoryWorkspaceStore::new();
        let ws = workspace();
        store.create(&ws).await.unwrap();

        let fake = Arc::new(
            FakeInfrastructure::new("fake")
                .with_recoverable(RuntimeIdentity::new(&ws.id, "main", "user-alice"))
                .with_recoverable(RuntimeIdentity::new("workspace-gone", "main", "user-alice")),
        );
        let runtimes = runtimes_with(&fake);
        let seen = record(&runtimes);

        assert_eq!(runtimes.recover(&store).await, 1);
        assert_eq!(runtimes.status(&ws.id), Running);
        assert!(runtimes.has_runtime(&ws.id));
        assert!(seen.lock().unwrap().is_empty());

        assert_eq!(runtimes.recover(&store).await, 0);
        assert_eq!(fake.started_count(), 0);
    }

    #[tokio::test]
    async fn test_inject_runtime() {
        let fake = Arc::new(FakeInfrastructure::new("fake"));
        let runtimes = runtimes_with(&fake);
        let mut ws = workspace();
        runtimes.start(&ws, None, StartOptions::new()).await.unwrap();

        runtimes.inject_runtime(&mut ws).await;
        assert_eq!(ws.status, Running);
        assert!(ws.runtime.as_ref().unwrap().dev_machine().is_some());
    }
}
