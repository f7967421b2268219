//! Workspace configuration library.
//!
//! ## Main Features
//! - Declarative workspace model: environments, recipes, machines, commands
//! - Structural validation of workspace configurations
//! - Engine settings with file and environment overrides

pub mod config;
pub mod engine;
pub mod validate;

pub use config::{
    Command, Environment, MachineConfig, ProjectConfig, Recipe, ServerConfig, SourceConfig,
    WorkspaceConfig, DEV_MACHINE_INSTALLER,
};
pub use engine::{
    EngineConfig, JanitorSettings, LoggingSettings, PolicyDefaults, PoolConfig, PoolKind,
};
pub use validate::WorkspaceConfigValidator;
