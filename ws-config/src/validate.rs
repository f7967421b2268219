use crate::config::{Environment, WorkspaceConfig};
use once_cell::sync::Lazy;
use regex::Regex;
use ws_core::error::{Result, WsError};

/// Workspace names: 3 to 100 characters, word characters, dots and dashes,
/// starting and ending with an alphanumeric character.
static WORKSPACE_NAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{1,98}[A-Za-z0-9]$")
        .expect("Workspace name regex should compile - this is a static pattern")
});

static SERVER_PORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{1,5}(/(tcp|udp))?$")
        .expect("Server port regex should compile - this is a static pattern")
});

/// Structural checks on a workspace configuration.
///
/// Infrastructure specific checks (can this recipe be run, are the requested
/// resources available) happen later through the infrastructure's `estimate`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkspaceConfigValidator;

impl WorkspaceConfigValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, config: &WorkspaceConfig) -> Result<()> {
        if !WORKSPACE_NAME_REGEX.is_match(&config.name) {
            return Err(WsError::bad_request(format!(
                "Incorrect workspace name '{}'. It must be 3-100 characters long, contain \
                 only letters, digits, dots, dashes and underscores, and start and end \
                 with a letter or digit",
                config.name
            )));
        }

        if config.default_env.trim().is_empty() {
            return Err(WsError::bad_request(format!(
                "Workspace '{}' must contain a default environment",
                config.name
            )));
        }

        if !config.environments.contains_key(&config.default_env) {
            return Err(WsError::bad_request(format!(
                "Workspace '{}' doesn't contain its default environment '{}'",
                config.name, config.default_env
            )));
        }

        for (env_name, environment) in &config.environments {
            if env_name.trim().is_empty() {
                return Err(WsError::bad_request(format!(
                    "Workspace '{}' contains an environment with an empty name",
                    config.name
                )));
            }
            self.validate_environment(env_name, environment)?;
        }

        for command in &config.commands {
            if command.name.trim().is_empty() {
                return Err(WsError::bad_request(format!(
                    "Workspace '{}' contains a command without a name",
                    config.name
                )));
            }
            if command.command_line.trim().is_empty() {
                return Err(WsError::bad_request(format!(
                    "Command line of command '{}' in workspace '{}' must not be empty",
                    command.name, config.name
                )));
            }
        }

        for project in &config.projects {
            if project.name.trim().is_empty() || project.path.trim().is_empty() {
                return Err(WsError::bad_request(format!(
                    "Projects of workspace '{}' must have a name and a path",
                    config.name
                )));
            }
        }

        Ok(())
    }

    pub fn validate_environment(&self, env_name: &str, environment: &Environment) -> Result<()> {
        let recipe = &environment.recipe;
        if recipe.recipe_type.trim().is_empty() {
            return Err(WsError::bad_request(format!(
                "Type of environment '{}' recipe must not be empty",
                env_name
            )));
        }

        if recipe.content.is_some() && recipe.location.is_some() {
            return Err(WsError::bad_request(format!(
                "Recipe of environment '{}' must contain either content or location, not both",
                env_name
            )));
        }

        if !environment.is_recipe_driven() {
            let dev = environment.dev_machines();
            if dev.len() != 1 {
                return Err(WsError::bad_request(format!(
                    "Environment '{}' must contain exactly one dev machine, found {}",
                    env_name,
                    dev.len()
                )));
            }
        }

        for (machine_name, machine) in &environment.machines {
            if machine_name.trim().is_empty() {
                return Err(WsError::bad_request(format!(
                    "Environment '{}' contains a machine with an empty name",
                    env_name
                )));
            }
            for (server_ref, server) in &machine.servers {
                if !SERVER_PORT_REGEX.is_match(&server.port) {
                    return Err(WsError::bad_request(format!(
                        "Server '{}' of machine '{}' in environment '{}' has invalid port '{}'",
                        server_ref, machine_name, env_name, server.port
                    )));
                }
            }
        }

        Ok(())
    }
}
