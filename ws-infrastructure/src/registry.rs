use crate::{RuntimeIdentity, RuntimeInfrastructure};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use ws_config::Environment;
use ws_core::error::{Result, WsError};

/// Maps recipe types to the infrastructures running them.
///
/// Populated once at startup and read-only afterwards. When two
/// infrastructures claim the same recipe type the one registered last wins.
#[derive(Clone, Default)]
pub struct InfrastructureRegistry {
    by_recipe_type: HashMap<String, Arc<dyn RuntimeInfrastructure>>,
    infrastructures: Vec<Arc<dyn RuntimeInfrastructure>>,
}

impl InfrastructureRegistry {
    pub fn new(infrastructures: Vec<Arc<dyn RuntimeInfrastructure>>) -> Self {
        let mut by_recipe_type: HashMap<String, Arc<dyn RuntimeInfrastructure>> = HashMap::new();
        for infra in &infrastructures {
            for recipe_type in infra.recipe_types() {
                if let Some(previous) = by_recipe_type.insert(recipe_type.clone(), Arc::clone(infra))
                {
                    warn!(
                        recipe_type = %recipe_type,
                        "Infrastructure '{}' replaces '{}' for recipe type",
                        infra.name(),
                        previous.name()
                    );
                }
            }
        }
        Self {
            by_recipe_type,
            infrastructures,
        }
    }

    /// Infrastructure handling `recipe_type`, `NotFound` if none does.
    pub fn get(&self, recipe_type: &str) -> Result<Arc<dyn RuntimeInfrastructure>> {
        self.by_recipe_type
            .get(recipe_type)
            .cloned()
            .ok_or_else(|| {
                WsError::not_found(format!(
                    "No infrastructure supports recipe type '{}'",
                    recipe_type
                ))
            })
    }

    pub fn supports(&self, recipe_type: &str) -> bool {
        self.by_recipe_type.contains_key(recipe_type)
    }

    /// Registered recipe types, sorted.
    pub fn recipe_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.by_recipe_type.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn infrastructures(&self) -> &[Arc<dyn RuntimeInfrastructure>] {
        &self.infrastructures
    }

    /// Resolve the infrastructure for the environment's recipe and let it
    /// validate the environment.
    pub fn estimate(&self, environment: &Environment) -> Result<Environment> {
        self.get(&environment.recipe.recipe_type)?
            .estimate(environment)
    }

    /// Runtimes already running in any infrastructure, paired with their owner.
    ///
    /// Infrastructures that can't enumerate their runtimes are skipped.
    pub fn recoverable_identities(&self) -> Vec<(Arc<dyn RuntimeInfrastructure>, RuntimeIdentity)> {
        let mut found = Vec::new();
        for infra in &self.infrastructures {
            match infra.identities() {
                Ok(identities) => {
                    found.extend(identities.into_iter().map(|id| (Arc::clone(infra), id)));
                }
                Err(WsError::NotSupported(msg)) => {
                    info!(infrastructure = infra.name(), "Skipping recovery: {}", msg);
                }
                Err(e) => {
                    warn!(
                        infrastructure = infra.name(),
                        "Failed to list running runtimes: {}",
                        e
                    );
                }
            }
        }
        found
    }
}

impl std::fmt::Debug for InfrastructureRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfrastructureRegistry")
            .field("recipe_types", &self.recipe_types())
            .finish()
    }
}
