//! Runtime infrastructure abstraction library.
//!
//! An infrastructure turns an environment recipe into running machines. Each
//! implementation declares the recipe types it handles; the
//! [`InfrastructureRegistry`] dispatches to it by recipe type. The contract is
//! synchronous: implementations are free to block, and callers on an async
//! runtime move calls onto blocking threads.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use ws_config::{Environment, MachineConfig};
use ws_snapshot::Snapshot;

pub use context::{StartOptions, StopOptions};
pub use registry::InfrastructureRegistry;
pub use ws_core::error::{Result, WsError};

pub mod context;
pub mod registry;

// When the `test-helpers` feature is enabled, include the fake infrastructure.
#[cfg(feature = "test-helpers")]
pub mod mock;

/// The triple identifying one running instance of a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuntimeIdentity {
    pub workspace_id: String,
    pub env_name: String,
    pub owner_id: String,
}

impl RuntimeIdentity {
    pub fn new(
        workspace_id: impl Into<String>,
        env_name: impl Into<String>,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            env_name: env_name.into(),
            owner_id: owner_id.into(),
        }
    }
}

impl fmt::Display for RuntimeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.workspace_id, self.env_name, self.owner_id
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MachineStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// A server exposed by a running machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// Snapshot of a machine's state as exposed by a runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub name: String,
    pub status: MachineStatus,
    pub dev: bool,
    #[serde(default)]
    pub servers: IndexMap<String, Server>,
    #[serde(default)]
    pub attributes: IndexMap<String, String>,
}

impl Machine {
    pub fn new(name: impl Into<String>, status: MachineStatus) -> Self {
        Self {
            name: name.into(),
            status,
            dev: false,
            servers: IndexMap::new(),
            attributes: IndexMap::new(),
        }
    }

    pub fn with_dev(mut self, dev: bool) -> Self {
        self.dev = dev;
        self
    }
}

/// Live, backend-owned handle of a started environment.
pub trait InternalRuntime: Send + Sync {
    fn identity(&self) -> &RuntimeIdentity;

    /// Current machines of the runtime. The returned map is a copy; later
    /// changes of the runtime do not show up in it.
    fn machines(&self) -> IndexMap<String, Machine>;

    /// Stop every machine and release the resources of the runtime.
    fn stop(&self, options: &StopOptions) -> Result<()>;

    /// Capture a machine. The returned snapshot carries the payload reference.
    fn snapshot_machine(&self, machine_name: &str) -> Result<Snapshot> {
        let _ = machine_name;
        Err(WsError::not_supported(format!(
            "Runtime of workspace '{}' doesn't support snapshots",
            self.identity().workspace_id
        )))
    }

    /// Add a machine to the running environment.
    fn start_machine(&self, machine_name: &str, config: &MachineConfig) -> Result<Machine> {
        let _ = (machine_name, config);
        Err(WsError::not_supported(format!(
            "Runtime of workspace '{}' doesn't support starting machines",
            self.identity().workspace_id
        )))
    }

    /// Stop and remove one machine of the running environment.
    fn stop_machine(&self, machine_name: &str) -> Result<()> {
        let _ = machine_name;
        Err(WsError::not_supported(format!(
            "Runtime of workspace '{}' doesn't support stopping machines",
            self.identity().workspace_id
        )))
    }

    /// The dev machine, if the runtime has one.
    fn dev_machine(&self) -> Option<Machine> {
        self.machines().into_values().find(|m| m.dev)
    }
}

/// Prepared, not yet started runtime of one environment.
pub trait Preparer: Send {
    fn start(self: Box<Self>, options: &StartOptions) -> Result<Arc<dyn InternalRuntime>>;
}

/// The core trait for all runtime infrastructures.
pub trait RuntimeInfrastructure: Send + Sync {
    /// Get the name of the infrastructure (e.g., "docker", "kubernetes").
    fn name(&self) -> &str;

    /// Recipe types this infrastructure knows how to run.
    fn recipe_types(&self) -> Vec<String>;

    /// Validate an environment without starting it, returning the environment
    /// the infrastructure would actually run. Fails with `Validation`.
    fn estimate(&self, environment: &Environment) -> Result<Environment>;

    /// Identities of runtimes that are already running, e.g. after a restart.
    fn identities(&self) -> Result<Vec<RuntimeIdentity>> {
        Err(WsError::not_supported(format!(
            "Infrastructure '{}' doesn't support runtime recovery",
            self.name()
        )))
    }

    /// Handle of an already running runtime reported by [`identities`](Self::identities).
    fn runtime(&self, identity: &RuntimeIdentity) -> Result<Arc<dyn InternalRuntime>> {
        Err(WsError::not_supported(format!(
            "Infrastructure '{}' can't recover runtime {}",
            self.name(),
            identity
        )))
    }

    fn prepare(
        &self,
        identity: &RuntimeIdentity,
        environment: &Environment,
    ) -> Result<Box<dyn Preparer>>;

    /// Remove the binary payload of a snapshot produced by this infrastructure.
    fn remove_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        Err(WsError::not_supported(format!(
            "Infrastructure '{}' doesn't store snapshot '{}'",
            self.name(),
            snapshot.id
        )))
    }
}
