//! Declarative workspace configuration.
//!
//! A workspace is a set of named environments; each environment is a recipe
//! plus the machines it declares. These types are plain data: validation lives
//! in [`crate::validate`], and nothing here knows how an environment is run.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use ws_core::error::{Result, WsError};

/// Installer that marks a machine as the workspace's dev machine.
pub const DEV_MACHINE_INSTALLER: &str = "ws-agent";

/// Machine attribute that marks a machine as the dev machine without the installer.
pub const DEV_MACHINE_ATTRIBUTE: &str = "dev";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub default_env: String,

    #[serde(default)]
    pub environments: IndexMap<String, Environment>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<Command>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub projects: Vec<ProjectConfig>,
}

impl WorkspaceConfig {
    /// Parse a workspace configuration from YAML text.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml_ng::from_str(yaml)?)
    }

    /// Load a workspace configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn environment(&self, name: &str) -> Result<&Environment> {
        self.environments.get(name).ok_or_else(|| {
            WsError::not_found(format!(
                "Workspace '{}' doesn't contain environment '{}'",
                self.name, name
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub recipe: Recipe,

    #[serde(default)]
    pub machines: IndexMap<String, MachineConfig>,
}

impl Environment {
    /// An environment whose machines come from recipe content or a recipe location.
    /// The dev machine constraint of such environments is left to the infrastructure.
    pub fn is_recipe_driven(&self) -> bool {
        self.recipe.content.is_some() || self.recipe.location.is_some()
    }

    /// Names of machines flagged as dev machines, in declaration order.
    pub fn dev_machines(&self) -> Vec<&str> {
        self.machines
            .iter()
            .filter(|(_, machine)| machine.is_dev())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    #[serde(rename = "type")]
    pub recipe_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl Recipe {
    pub fn new(recipe_type: impl Into<String>) -> Self {
        Self {
            recipe_type: recipe_type.into(),
            content_type: None,
            content: None,
            location: None,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub installers: Vec<String>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub servers: IndexMap<String, ServerConfig>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub attributes: IndexMap<String, String>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub env: IndexMap<String, String>,
}

impl MachineConfig {
    pub fn is_dev(&self) -> bool {
        self.installers.iter().any(|i| i == DEV_MACHINE_INSTALLER)
            || self
                .attributes
                .get(DEV_MACHINE_ATTRIBUTE)
                .is_some_and(|v| v == "true")
    }

    /// A machine config flagged as the dev machine.
    pub fn dev() -> Self {
        Self {
            installers: vec![DEV_MACHINE_INSTALLER.to_string()],
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port with optional protocol suffix, e.g. `8080` or `8080/tcp`.
    pub port: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    pub command_line: String,

    #[serde(rename = "type", default = "default_command_type")]
    pub command_type: String,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub attributes: IndexMap<String, String>,
}

fn default_command_type() -> String {
    "custom".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub source_type: String,
    pub location: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
name: dev
default_env: main
environments:
  main:
    recipe:
      type: compose
      content: "services: {}"
    machines:
      app:
        installers: [ws-agent, terminal]
        servers:
          web:
            port: "8080/tcp"
      db:
        attributes:
          memory_limit: "512m"
commands:
  - name: build
    command_line: cargo build
"#;

    #[test]
    fn test_parse_yaml_keeps_declaration_order() {
        let config = WorkspaceConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.name, "dev");
        let env = config.environment("main").unwrap();
        let names: Vec<&str> = env.machines.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["app", "db"]);
        assert_eq!(env.recipe.recipe_type, "compose");
        assert_eq!(config.commands[0].command_type, "custom");
    }

    #[test]
    fn test_dev_machine_detection() {
        let config = WorkspaceConfig::from_yaml(SAMPLE).unwrap();
        let env = config.environment("main").unwrap();
        assert_eq!(env.dev_machines(), vec!["app"]);
        assert!(env.is_recipe_driven());

        let mut attrs = MachineConfig::default();
        attrs
            .attributes
            .insert(DEV_MACHINE_ATTRIBUTE.to_string(), "true".to_string());
        assert!(attrs.is_dev());
    }

    #[test]
    fn test_missing_environment_is_not_found() {
        let config = WorkspaceConfig::from_yaml(SAMPLE).unwrap();
        let err = config.environment("other").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_invalid_yaml_is_bad_request() {
        let err = WorkspaceConfig::from_yaml("name: [").unwrap_err();
        assert!(matches!(err, WsError::BadRequest(_)));
    }
}
