use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use ws_core::error::{Result, WsError};

/// The owner of a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
}

/// Resolves a namespace to the account owning it.
#[async_trait]
pub trait AccountResolver: Send + Sync {
    /// The account named `name`, `NotFound` if there is none.
    async fn get_by_name(&self, name: &str) -> Result<Account>;
}

/// Fixed namespace to account table.
#[derive(Debug, Clone, Default)]
pub struct StaticAccountResolver {
    accounts: HashMap<String, Account>,
}

impl StaticAccountResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account(mut self, name: impl Into<String>, id: impl Into<String>) -> Self {
        let name = name.into();
        self.accounts.insert(
            name.clone(),
            Account {
                id: id.into(),
                name,
            },
        );
        self
    }
}

#[async_trait]
impl AccountResolver for StaticAccountResolver {
    async fn get_by_name(&self, name: &str) -> Result<Account> {
        self.accounts
            .get(name)
            .cloned()
            .ok_or_else(|| WsError::not_found(format!("Account '{}' doesn't exist", name)))
    }
}
