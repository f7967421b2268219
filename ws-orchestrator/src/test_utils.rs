use indexmap::IndexMap;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use ws_config::{Environment, MachineConfig, Recipe, WorkspaceConfig};

/// Machine flagged as the dev machine in [`sample_config`].
pub const SAMPLE_DEV_MACHINE: &str = "dev-machine";

/// Helper to create an in-memory test database with migrations applied
pub async fn create_test_db() -> SqlitePool {
    // A single connection, every new in-memory connection is a fresh database
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// A valid workspace with one environment, `main`, holding a single dev machine.
pub fn sample_config(name: &str, recipe_type: &str) -> WorkspaceConfig {
    let mut machines = IndexMap::new();
    machines.insert(SAMPLE_DEV_MACHINE.to_string(), MachineConfig::dev());

    let mut environments = IndexMap::new();
    environments.insert(
        "main".to_string(),
        Environment {
            recipe: Recipe::new(recipe_type),
            machines,
        },
    );

    WorkspaceConfig {
        name: name.to_string(),
        description: None,
        default_env: "main".to_string(),
        environments,
        commands: Vec::new(),
        projects: Vec::new(),
    }
}
