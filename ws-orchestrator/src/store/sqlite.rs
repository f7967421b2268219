use super::WorkspaceStore;
use crate::db;
use crate::error::from_sqlx;
use crate::workspace::Workspace;
use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use sqlx::SqlitePool;
use std::path::Path;
use ws_core::error::{Result, WsError};

/// Workspace store backed by SQLite.
#[derive(Debug, Clone)]
pub struct SqliteWorkspaceStore {
    pool: SqlitePool,
}

impl SqliteWorkspaceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (or create) the database at `db_path` and apply migrations.
    pub async fn connect(db_path: &Path) -> Result<Self> {
        let pool = db::create_pool(db_path).await?;
        db::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn not_found(id: &str) -> WsError {
        WsError::not_found(format!("Workspace with id '{}' doesn't exist", id))
    }

    async fn fetch_many(&self, sql: &str, bind: &str) -> Result<Vec<Workspace>> {
        let rows = sqlx::query_as::<_, WorkspaceRow>(sql)
            .bind(bind)
            .fetch_all(&self.pool)
            .await
            .map_err(from_sqlx)?;
        rows.into_iter().map(Workspace::try_from).collect()
    }
}

#[async_trait]
impl WorkspaceStore for SqliteWorkspaceStore {
    async fn create(&self, workspace: &Workspace) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO workspaces (id, name, namespace, owner_id, config, attributes, temporary, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&workspace.id)
        .bind(workspace.name())
        .bind(&workspace.namespace)
        .bind(&workspace.owner_id)
        .bind(serde_json::to_string(&workspace.config)?)
        .bind(serde_json::to_string(&workspace.attributes)?)
        .bind(workspace.temporary)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(from_sqlx)?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Workspace> {
        sqlx::query_as::<_, WorkspaceRow>("SELECT * FROM workspaces WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(from_sqlx)?
            .ok_or_else(|| Self::not_found(id))?
            .try_into()
    }

    async fn get_by_name(&self, name: &str, namespace: &str) -> Result<Workspace> {
        sqlx::query_as::<_, WorkspaceRow>(
            "SELECT * FROM workspaces WHERE name = ? AND namespace = ?",
        )
        .bind(name)
        .bind(namespace)
        .fetch_optional(&self.pool)
        .await
        .map_err(from_sqlx)?
        .ok_or_else(|| {
            WsError::not_found(format!("Workspace '{}/{}' doesn't exist", namespace, name))
        })?
        .try_into()
    }

    async fn get_by_namespace(&self, namespace: &str) -> Result<Vec<Workspace>> {
        self.fetch_many(
            "SELECT * FROM workspaces WHERE namespace = ? ORDER BY created_at, id",
            namespace,
        )
        .await
    }

    async fn get_by_owner(&self, owner_id: &str) -> Result<Vec<Workspace>> {
        self.fetch_many(
            "SELECT * FROM workspaces WHERE owner_id = ? ORDER BY created_at, id",
            owner_id,
        )
        .await
    }

    async fn get_temporary(&self, skip: usize, limit: usize) -> Result<Vec<Workspace>> {
        let rows = sqlx::query_as::<_, WorkspaceRow>(
            "SELECT * FROM workspaces WHERE temporary = 1 ORDER BY created_at, id LIMIT ? OFFSET ?",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(skip).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(from_sqlx)?;
        rows.into_iter().map(Workspace::try_from).collect()
    }

    async fn update(&self, workspace: &Workspace) -> Result<Workspace> {
        let result = sqlx::query(
            r#"
            UPDATE workspaces
            SET name = ?, namespace = ?, owner_id = ?, config = ?, attributes = ?, temporary = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(workspace.name())
        .bind(&workspace.namespace)
        .bind(&workspace.owner_id)
        .bind(serde_json::to_string(&workspace.config)?)
        .bind(serde_json::to_string(&workspace.attributes)?)
        .bind(workspace.temporary)
        .bind(Utc::now().timestamp())
        .bind(&workspace.id)
        .execute(&self.pool)
        .await
        .map_err(from_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(Self::not_found(&workspace.id));
        }
        Ok(workspace.clone().at_rest())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM workspaces WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(from_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(Self::not_found(id));
        }
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct WorkspaceRow {
    id: String,
    #[allow(dead_code)]
    name: String,
    namespace: String,
    owner_id: String,
    config: String,
    attributes: String,
    temporary: bool,
    #[allow(dead_code)]
    created_at: i64,
    #[allow(dead_code)]
    updated_at: i64,
}

impl TryFrom<WorkspaceRow> for Workspace {
    type Error = WsError;

    fn try_from(row: WorkspaceRow) -> Result<Self> {
        let config = serde_json::from_str(&row.config).map_err(|e| {
            WsError::server(format!("Corrupt config of workspace '{}': {}", row.id, e))
        })?;
        let attributes: IndexMap<String, String> = serde_json::from_str(&row.attributes)
            .map_err(|e| {
                WsError::server(format!(
                    "Corrupt attributes of workspace '{}': {}",
                    row.id, e
                ))
            })?;

        let mut workspace = Workspace::new(config, row.namespace, row.owner_id);
        workspace.id = row.id;
        workspace.attributes = attributes;
        workspace.temporary = row.temporary;
        Ok(workspace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_db, sample_config};

    async fn store() -> SqliteWorkspaceStore {
        SqliteWorkspaceStore::new(create_test_db().await)
    }

    #[tokio::test]
    async fn test_round_trip() {
        let store = store().await;
        let mut ws = Workspace::new(sample_config("dev", "docker"), "alice", "user-alice");
        ws.attributes
            .insert("auto_snapshot".to_string(), "false".to_string());
        store.create(&ws).await.unwrap();

        let loaded = store.get(&ws.id).await.unwrap();
        assert_eq!(loaded, ws);
        assert_eq!(store.get_by_name("dev", "alice").await.unwrap().id, ws.id);
    }

    #[tokio::test]
    async fn test_duplicate_name_conflicts() {
        let store = store().await;
        let first = Workspace::new(sample_config("dev", "docker"), "alice", "user-alice");
        let second = Workspace::new(sample_config("dev", "docker"), "alice", "user-alice");
        store.create(&first).await.unwrap();
        assert!(store.create(&second).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_missing_rows_are_not_found() {
        let store = store().await;
        let ws = Workspace::new(sample_config("dev", "docker"), "alice", "user-alice");
        assert!(store.get(&ws.id).await.unwrap_err().is_not_found());
        assert!(store.update(&ws).await.unwrap_err().is_not_found());
        assert!(store.remove(&ws.id).await.unwrap_err().is_not_found());
        assert!(store
            .get_by_name("dev", "alice")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_temporary_query() {
        let store = store().await;
        for i in 0..3 {
            let mut ws = Workspace::new(
                sample_config(&format!("tmp{i}"), "docker"),
                "alice",
                "user-alice",
            );
            ws.temporary = i != 1;
            store.create(&ws).await.unwrap();
        }
        assert_eq!(store.get_temporary(0, 10).await.unwrap().len(), 2);
        assert_eq!(store.get_temporary(1, 10).await.unwrap().len(), 1);
        assert!(store.get_temporary(2, 10).await.unwrap().is_empty());
        assert_eq!(store.get_by_owner("user-alice").await.unwrap().len(), 3);
    }
}
