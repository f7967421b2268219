//! Options passed to infrastructure start and stop operations
//!
//! Options are plain data handed across the infrastructure contract, so new
//! knobs can be added without breaking implementations.

use indexmap::IndexMap;
use ws_snapshot::Snapshot;

/// Options for starting a runtime
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Start machines from their snapshots instead of from the recipe
    pub restore: bool,
    /// Snapshots to restore from, one per machine, when `restore` is set
    pub snapshots: Vec<Snapshot>,
    /// Free-form options understood by specific infrastructures
    pub options: IndexMap<String, String>,
}

impl StartOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from the given snapshots
    pub fn restore_from(mut self, snapshots: Vec<Snapshot>) -> Self {
        self.restore = true;
        self.snapshots = snapshots;
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Snapshot of the given machine, if restoring
    pub fn snapshot_for(&self, machine_name: &str) -> Option<&Snapshot> {
        if !self.restore {
            return None;
        }
        self.snapshots.iter().find(|s| s.machine_name == machine_name)
    }
}

/// Options for stopping a runtime
#[derive(Debug, Clone, Default)]
pub struct StopOptions {
    /// Human readable reason, recorded in logs and workspace attributes
    pub reason: Option<String>,
    /// Name of the user who requested the stop
    pub stopped_by: Option<String>,
    pub options: IndexMap<String, String>,
}

impl StopOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn stopped_by(mut self, user: impl Into<String>) -> Self {
        self.stopped_by = Some(user.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_for_requires_restore() {
        let snapshot = Snapshot::new("ws1", "main", "app", "docker");
        let mut options = StartOptions {
            snapshots: vec![snapshot.clone()],
            ..Default::default()
        };
        assert!(options.snapshot_for("app").is_none());

        options = StartOptions::new().restore_from(vec![snapshot.clone()]);
        assert_eq!(options.snapshot_for("app"), Some(&snapshot));
        assert!(options.snapshot_for("db").is_none());
    }
}
