//! Mapping of persistence failures onto the engine's error taxonomy.

pub use ws_core::error::{Result, WsError};

/// Translate a database error: missing rows are `NotFound`, unique
/// constraint violations are `Conflict`, everything else is `Server`.
pub fn from_sqlx(err: sqlx::Error) -> WsError {
    match err {
        sqlx::Error::RowNotFound => WsError::not_found("Requested record doesn't exist"),
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            WsError::conflict(format!("Record already exists: {}", db.message()))
        }
        other => WsError::server(format!("Database error: {other}")),
    }
}

pub fn from_migrate(err: sqlx::migrate::MigrateError) -> WsError {
    WsError::server(format!("Migration error: {err}"))
}
