use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use ws_config::WorkspaceConfig;
use ws_infrastructure::{InternalRuntime, Machine};

/// Names of the bookkeeping attributes the engine maintains on workspaces.
pub mod attributes {
    /// Creation time, milliseconds since the epoch
    pub const CREATED: &str = "created";
    /// Last update or start time, milliseconds since the epoch
    pub const UPDATED: &str = "updated";
    /// Time the last stop completed, milliseconds since the epoch
    pub const STOPPED: &str = "stopped";
    /// Name of the user who stopped the workspace
    pub const STOPPED_BY: &str = "stopped_by";
    /// Error of the last stop, if it failed
    pub const STOP_ERROR: &str = "stop_error";
    /// Per-workspace restore policy, `true` or `false`
    pub const AUTO_RESTORE: &str = "auto_restore";
    /// Per-workspace snapshot policy, `true` or `false`
    pub const AUTO_SNAPSHOT: &str = "auto_snapshot";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkspaceStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    /// Overlay of `Running` while machines are being captured
    Snapshotting,
    Stopping,
}

impl fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkspaceStatus::Stopped => "STOPPED",
            WorkspaceStatus::Starting => "STARTING",
            WorkspaceStatus::Running => "RUNNING",
            WorkspaceStatus::Snapshotting => "SNAPSHOTTING",
            WorkspaceStatus::Stopping => "STOPPING",
        };
        f.write_str(s)
    }
}

/// Read-only description of a live runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Runtime {
    pub active_env: String,
    pub owner_id: String,
    pub machines: IndexMap<String, Machine>,
}

impl Runtime {
    /// Copy the current state of a live runtime.
    pub fn from_internal(runtime: &dyn InternalRuntime) -> Self {
        let identity = runtime.identity();
        Self {
            active_env: identity.env_name.clone(),
            owner_id: identity.owner_id.clone(),
            machines: runtime.machines(),
        }
    }

    pub fn dev_machine(&self) -> Option<&Machine> {
        self.machines.values().find(|m| m.dev)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub namespace: String,
    pub owner_id: String,
    pub config: WorkspaceConfig,

    #[serde(default)]
    pub attributes: IndexMap<String, String>,

    #[serde(default)]
    pub temporary: bool,

    /// Derived from the runtime registry, never persisted
    #[serde(default)]
    pub status: WorkspaceStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<Runtime>,
}

impl Workspace {
    pub fn new(
        config: WorkspaceConfig,
        namespace: impl Into<String>,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Self::generate_id(),
            namespace: namespace.into(),
            owner_id: owner_id.into(),
            config,
            attributes: IndexMap::new(),
            temporary: false,
            status: WorkspaceStatus::Stopped,
            runtime: None,
        }
    }

    pub fn generate_id() -> String {
        format!("workspace{}", Uuid::new_v4().simple())
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// `namespace/name`, unique across the store.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.config.name)
    }

    /// A boolean policy attribute; `None` when absent or not a boolean.
    pub fn attribute_flag(&self, name: &str) -> Option<bool> {
        self.attributes.get(name).and_then(|v| v.parse().ok())
    }

    /// Set `name` to the current time in milliseconds.
    pub fn stamp(&mut self, name: &str) {
        self.attributes
            .insert(name.to_string(), Utc::now().timestamp_millis().to_string());
    }

    pub fn timestamp(&self, name: &str) -> Option<i64> {
        self.attributes.get(name).and_then(|v| v.parse().ok())
    }

    /// The workspace as persisted: no status, no runtime.
    pub fn at_rest(mut self) -> Self {
        self.status = WorkspaceStatus::Stopped;
        self.runtime = None;
        self
    }
}
