//! In-process fake infrastructure for tests.
//!
//! Machines are plain records; "starting" an environment optionally sleeps
//! for a configured delay and then either fails with a configured message or
//! returns a runtime holding one machine per declared machine.

use crate::{
    InternalRuntime, Machine, MachineStatus, Preparer, RuntimeIdentity, RuntimeInfrastructure,
    StartOptions, StopOptions,
};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use ws_config::{Environment, MachineConfig};
use ws_core::error::{Result, WsError};
use ws_snapshot::Snapshot;

/// Name of the machine created for environments that declare none.
pub const DEFAULT_DEV_MACHINE: &str = "dev-machine";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[derive(Default)]
struct FakeState {
    start_delay: Mutex<Duration>,
    start_failure: Mutex<Option<String>>,
    stop_failure: Mutex<Option<String>>,
    snapshot_failure: Mutex<Option<String>>,
    estimate_failure: Mutex<Option<String>>,
    recoverable: Mutex<Vec<RuntimeIdentity>>,
    recovery_unsupported: AtomicBool,
    empty_runtimes: AtomicBool,
    removed_payloads: Mutex<Vec<String>>,
    last_start_options: Mutex<Option<StartOptions>>,
    live: Mutex<HashMap<String, Arc<FakeRuntime>>>,
    prepared: AtomicUsize,
    started: AtomicUsize,
    stopped: AtomicUsize,
    snapshots_taken: AtomicUsize,
}

/// Configurable fake [`RuntimeInfrastructure`].
pub struct FakeInfrastructure {
    name: String,
    recipe_types: Vec<String>,
    state: Arc<FakeState>,
}

impl FakeInfrastructure {
    /// A fake handling the recipe type equal to its name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            recipe_types: vec![name.clone()],
            name,
            state: Arc::new(FakeState::default()),
        }
    }

    pub fn with_recipe_types(mut self, types: &[&str]) -> Self {
        self.recipe_types = types.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_start_delay(self, delay: Duration) -> Self {
        self.set_start_delay(delay);
        self
    }

    pub fn failing_start(self, message: impl Into<String>) -> Self {
        self.set_start_failure(Some(message.into()));
        self
    }

    pub fn failing_stop(self, message: impl Into<String>) -> Self {
        self.set_stop_failure(Some(message.into()));
        self
    }

    pub fn failing_snapshot(self, message: impl Into<String>) -> Self {
        *lock(&self.state.snapshot_failure) = Some(message.into());
        self
    }

    pub fn failing_estimate(self, message: impl Into<String>) -> Self {
        *lock(&self.state.estimate_failure) = Some(message.into());
        self
    }

    /// Report `identity` as already running when asked for recoverable runtimes.
    pub fn with_recoverable(self, identity: RuntimeIdentity) -> Self {
        lock(&self.state.recoverable).push(identity);
        self
    }

    /// Behave like an infrastructure that can't enumerate its runtimes.
    pub fn without_recovery(self) -> Self {
        self.state.recovery_unsupported.store(true, Ordering::SeqCst);
        self
    }

    /// Return runtimes without machines, which breaks the infrastructure contract.
    pub fn returning_empty_runtimes(self) -> Self {
        self.state.empty_runtimes.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_start_delay(&self, delay: Duration) {
        *lock(&self.state.start_delay) = delay;
    }

    pub fn set_start_failure(&self, message: Option<String>) {
        *lock(&self.state.start_failure) = message;
    }

    pub fn set_stop_failure(&self, message: Option<String>) {
        *lock(&self.state.stop_failure) = message;
    }

    pub fn prepared_count(&self) -> usize {
        self.state.prepared.load(Ordering::SeqCst)
    }

    pub fn started_count(&self) -> usize {
        self.state.started.load(Ordering::SeqCst)
    }

    pub fn stopped_count(&self) -> usize {
        self.state.stopped.load(Ordering::SeqCst)
    }

    pub fn snapshots_taken(&self) -> usize {
        self.state.snapshots_taken.load(Ordering::SeqCst)
    }

    /// Payload references passed to `remove_snapshot`, in call order.
    pub fn removed_payloads(&self) -> Vec<String> {
        lock(&self.state.removed_payloads).clone()
    }

    /// Options of the most recent start.
    pub fn last_start_options(&self) -> Option<StartOptions> {
        lock(&self.state.last_start_options).clone()
    }

    /// Live runtime of a workspace, for poking at it from tests.
    pub fn live_runtime(&self, workspace_id: &str) -> Option<Arc<FakeRuntime>> {
        lock(&self.state.live).get(workspace_id).cloned()
    }
}

impl RuntimeInfrastructure for FakeInfrastructure {
    fn name(&self) -> &str {
        &self.name
    }

    fn recipe_types(&self) -> Vec<String> {
        self.recipe_types.clone()
    }

    fn estimate(&self, environment: &Environment) -> Result<Environment> {
        if let Some(msg) = lock(&self.state.estimate_failure).clone() {
            return Err(WsError::validation(msg));
        }
        Ok(environment.clone())
    }

    fn identities(&self) -> Result<Vec<RuntimeIdentity>> {
        if self.state.recovery_unsupported.load(Ordering::SeqCst) {
            return Err(WsError::not_supported(format!(
                "Infrastructure '{}' doesn't support runtime recovery",
                self.name
            )));
        }
        Ok(lock(&self.state.recoverable).clone())
    }

    fn runtime(&self, identity: &RuntimeIdentity) -> Result<Arc<dyn InternalRuntime>> {
        let known = lock(&self.state.recoverable).contains(identity);
        if !known {
            return Err(WsError::not_found(format!(
                "Runtime {} is not running",
                identity
            )));
        }
        let mut machines = IndexMap::new();
        machines.insert(
            DEFAULT_DEV_MACHINE.to_string(),
            Machine::new(DEFAULT_DEV_MACHINE, MachineStatus::Running).with_dev(true),
        );
        let runtime = Arc::new(FakeRuntime {
            identity: identity.clone(),
            recipe_type: self.recipe_types.first().cloned().unwrap_or_default(),
            machines: Mutex::new(machines),
            state: Arc::clone(&self.state),
        });
        lock(&self.state.live).insert(identity.workspace_id.clone(), Arc::clone(&runtime));
        Ok(runtime)
    }

    fn prepare(
        &self,
        identity: &RuntimeIdentity,
        environment: &Environment,
    ) -> Result<Box<dyn Preparer>> {
        self.state.prepared.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakePreparer {
            identity: identity.clone(),
            environment: environment.clone(),
            state: Arc::clone(&self.state),
        }))
    }

    fn remove_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let payload = snapshot
            .payload
            .clone()
            .unwrap_or_else(|| snapshot.id.clone());
        lock(&self.state.removed_payloads).push(payload);
        Ok(())
    }
}

struct FakePreparer {
    identity: RuntimeIdentity,
    environment: Environment,
    state: Arc<FakeState>,
}

impl Preparer for FakePreparer {
    fn start(self: Box<Self>, options: &StartOptions) -> Result<Arc<dyn InternalRuntime>> {
        let delay = *lock(&self.state.start_delay);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        *lock(&self.state.last_start_options) = Some(options.clone());

        if let Some(msg) = lock(&self.state.start_failure).clone() {
            return Err(WsError::infrastructure(msg));
        }

        let mut machines = IndexMap::new();
        if !self.state.empty_runtimes.load(Ordering::SeqCst) {
            for (name, config) in &self.environment.machines {
                machines.insert(
                    name.clone(),
                    Machine::new(name.clone(), MachineStatus::Running).with_dev(config.is_dev()),
                );
            }
            if machines.is_empty() {
                machines.insert(
                    DEFAULT_DEV_MACHINE.to_string(),
                    Machine::new(DEFAULT_DEV_MACHINE, MachineStatus::Running).with_dev(true),
                );
            }
        }

        let runtime = Arc::new(FakeRuntime {
            identity: self.identity.clone(),
            recipe_type: self.environment.recipe.recipe_type.clone(),
            machines: Mutex::new(machines),
            state: Arc::clone(&self.state),
        });
        self.state.started.fetch_add(1, Ordering::SeqCst);
        lock(&self.state.live).insert(self.identity.workspace_id.clone(), Arc::clone(&runtime));
        Ok(runtime)
    }
}

/// Runtime produced by [`FakeInfrastructure`].
pub struct FakeRuntime {
    identity: RuntimeIdentity,
    recipe_type: String,
    machines: Mutex<IndexMap<String, Machine>>,
    state: Arc<FakeState>,
}

impl FakeRuntime {
    /// Change a machine's status as if the backend reported it.
    pub fn set_machine_status(&self, machine_name: &str, status: MachineStatus) {
        if let Some(machine) = lock(&self.machines).get_mut(machine_name) {
            machine.status = status;
        }
    }
}

impl InternalRuntime for FakeRuntime {
    fn identity(&self) -> &RuntimeIdentity {
        &self.identity
    }

    fn machines(&self) -> IndexMap<String, Machine> {
        lock(&self.machines).clone()
    }

    fn stop(&self, _options: &StopOptions) -> Result<()> {
        lock(&self.state.live).remove(&self.identity.workspace_id);
        if let Some(msg) = lock(&self.state.stop_failure).clone() {
            return Err(WsError::infrastructure(msg));
        }
        for machine in lock(&self.machines).values_mut() {
            machine.status = MachineStatus::Stopped;
        }
        self.state.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn snapshot_machine(&self, machine_name: &str) -> Result<Snapshot> {
        let machine = lock(&self.machines)
            .get(machine_name)
            .cloned()
            .ok_or_else(|| {
                WsError::not_found(format!("Machine '{}' doesn't exist", machine_name))
            })?;
        if let Some(msg) = lock(&self.state.snapshot_failure).clone() {
            return Err(WsError::infrastructure(msg));
        }
        self.state.snapshots_taken.fetch_add(1, Ordering::SeqCst);
        Ok(Snapshot::new(
            &self.identity.workspace_id,
            &self.identity.env_name,
            machine_name,
            &self.recipe_type,
        )
        .with_dev(machine.dev)
        .with_payload(format!(
            "fake://{}/{}/{}",
            self.identity.workspace_id, machine_name, self.state.snapshots_taken.load(Ordering::SeqCst)
        )))
    }

    fn start_machine(&self, machine_name: &str, config: &MachineConfig) -> Result<Machine> {
        let mut machines = lock(&self.machines);
        if machines.contains_key(machine_name) {
            return Err(WsError::conflict(format!(
                "Machine '{}' is already running",
                machine_name
            )));
        }
        let machine = Machine::new(machine_name, MachineStatus::Running).with_dev(config.is_dev());
        machines.insert(machine_name.to_string(), machine.clone());
        Ok(machine)
    }

    fn stop_machine(&self, machine_name: &str) -> Result<()> {
        lock(&self.machines)
            .shift_remove(machine_name)
            .map(|_| ())
            .ok_or_else(|| WsError::not_found(format!("Machine '{}' doesn't exist", machine_name)))
    }
}
