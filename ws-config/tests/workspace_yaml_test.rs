use std::fs;
use tempfile::TempDir;
use ws_config::{WorkspaceConfig, WorkspaceConfigValidator, DEV_MACHINE_INSTALLER};
use ws_core::WsError;

const WORKSPACE_YAML: &str = r#"
name: web-app
description: Frontend and API
default_env: dev
environments:
  dev:
    recipe:
      type: dockerimage
    machines:
      dev-machine:
        installers: [ws-agent]
        servers:
          web:
            port: 8080/tcp
            protocol: http
      db:
        env:
          POSTGRES_DB: app
  ci:
    recipe:
      type: compose
      content: |
        services:
          app:
            image: app:latest
commands:
  - name: build
    command_line: npm run build
projects:
  - name: web-app
    path: /projects/web-app
    source:
      type: git
      location: https://example.com/web-app.git
"#;

fn write_config(contents: &str) -> (TempDir, std::path::PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("workspace.yaml");
    fs::write(&path, contents).unwrap();
    (dir, path)
}

#[test]
fn test_load_and_validate_workspace_file() {
    let (_dir, path) = write_config(WORKSPACE_YAML);
    let config = WorkspaceConfig::load(&path).unwrap();

    assert_eq!(config.name, "web-app");
    assert_eq!(
        config.environments.keys().collect::<Vec<_>>(),
        vec!["dev", "ci"]
    );

    let dev = config.environment("dev").unwrap();
    assert_eq!(dev.recipe.recipe_type, "dockerimage");
    assert_eq!(dev.dev_machines(), vec!["dev-machine"]);
    assert_eq!(
        dev.machines["dev-machine"].installers,
        vec![DEV_MACHINE_INSTALLER.to_string()]
    );
    assert!(config.environment("ci").unwrap().is_recipe_driven());
    assert_eq!(config.commands[0].command_type, "custom");

    WorkspaceConfigValidator::new().validate(&config).unwrap();
}

#[test]
fn test_invalid_port_is_rejected() {
    let yaml = WORKSPACE_YAML.replace("8080/tcp", "http-alt");
    let config = WorkspaceConfig::from_yaml(&yaml).unwrap();

    let err = WorkspaceConfigValidator::new().validate(&config).unwrap_err();
    assert!(matches!(err, WsError::BadRequest(_)));
    assert!(err.message().contains("http-alt"));
}

#[test]
fn test_legacy_environment_without_dev_machine_is_rejected() {
    let yaml = WORKSPACE_YAML.replace("installers: [ws-agent]", "installers: []");
    let config = WorkspaceConfig::from_yaml(&yaml).unwrap();

    let err = WorkspaceConfigValidator::new().validate(&config).unwrap_err();
    assert!(err.message().contains("exactly one dev machine"));
}

#[test]
fn test_malformed_yaml_fails_to_load() {
    let (_dir, path) = write_config("name: [unclosed");
    assert!(WorkspaceConfig::load(&path).is_err());

    let missing = TempDir::new().unwrap().path().join("missing.yaml");
    assert!(matches!(WorkspaceConfig::load(&missing), Err(WsError::Io(_))));
}
