//! Snapshot metadata structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;
use ws_core::error::Result;

/// Point-in-time capture of one machine of a running workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub workspace_id: String,
    pub env_name: String,
    pub machine_name: String,
    pub created_at: DateTime<Utc>,

    /// Whether the captured machine is the workspace's dev machine
    #[serde(default)]
    pub dev: bool,

    /// Recipe type of the environment, selects the infrastructure owning the payload
    pub recipe_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Infrastructure specific reference to the binary payload (image, volume, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl Snapshot {
    pub fn new(
        workspace_id: impl Into<String>,
        env_name: impl Into<String>,
        machine_name: impl Into<String>,
        recipe_type: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("snapshot{}", Uuid::new_v4().simple()),
            workspace_id: workspace_id.into(),
            env_name: env_name.into(),
            machine_name: machine_name.into(),
            created_at: Utc::now(),
            dev: false,
            recipe_type: recipe_type.into(),
            description: None,
            payload: None,
        }
    }

    pub fn with_dev(mut self, dev: bool) -> Self {
        self.dev = dev;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Load snapshot metadata from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Save snapshot metadata to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_snapshot_has_unique_id() {
        let a = Snapshot::new("ws1", "main", "dev-machine", "docker");
        let b = Snapshot::new("ws1", "main", "dev-machine", "docker");
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("snapshot"));
        assert!(!a.dev);
    }

    #[test]
    fn test_save_and_load() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("meta.json");
        let snapshot = Snapshot::new("ws1", "main", "app", "docker")
            .with_dev(true)
            .with_payload("registry/ws1-app:latest");

        snapshot.save(&path).unwrap();
        assert!(!temp.path().join("meta.json.tmp").exists());
        assert_eq!(Snapshot::load(&path).unwrap(), snapshot);
    }
}
