use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// The closed set of failures surfaced by the workspace master.
///
/// Callers match on the variant the same way they would on distinct
/// exception types; the payload is a human readable message.
#[derive(Error, Debug)]
pub enum WsError {
    /// Unknown workspace, runtime, account, snapshot or recipe type.
    NotFound(String),
    /// Illegal state transition: double start, stop while stopped, remove while running.
    Conflict(String),
    /// Malformed or missing required input.
    BadRequest(String),
    /// Environment or recipe rejected by an infrastructure.
    Validation(String),
    /// Backend failure during prepare, start or stop.
    Infrastructure(String),
    /// Backend does not support the requested capability (e.g. runtime recovery).
    NotSupported(String),
    /// Contract violation inside the engine or an infrastructure.
    Internal(String),
    /// Persistence layer failure.
    Server(String),
    Io(#[from] std::io::Error),
    Other(#[from] anyhow::Error),
}

impl Display for WsError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            WsError::NotFound(s) => write!(f, "Not found: {}", s),
            WsError::Conflict(s) => write!(f, "Conflict: {}", s),
            WsError::BadRequest(s) => write!(f, "Bad request: {}", s),
            WsError::Validation(s) => write!(f, "Validation error: {}", s),
            WsError::Infrastructure(s) => write!(f, "Infrastructure error: {}", s),
            WsError::NotSupported(s) => write!(f, "Not supported: {}", s),
            WsError::Internal(s) => write!(f, "Internal error: {}", s),
            WsError::Server(s) => write!(f, "Server error: {}", s),
            WsError::Io(e) => write!(f, "I/O error: {}", e),
            WsError::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl WsError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        WsError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        WsError::Conflict(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        WsError::BadRequest(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        WsError::Validation(msg.into())
    }

    pub fn infrastructure(msg: impl Into<String>) -> Self {
        WsError::Infrastructure(msg.into())
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        WsError::NotSupported(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        WsError::Internal(msg.into())
    }

    pub fn server(msg: impl Into<String>) -> Self {
        WsError::Server(msg.into())
    }

    /// The message without the kind prefix, as carried by lifecycle events.
    pub fn message(&self) -> String {
        match self {
            WsError::NotFound(s)
            | WsError::Conflict(s)
            | WsError::BadRequest(s)
            | WsError::Validation(s)
            | WsError::Infrastructure(s)
            | WsError::NotSupported(s)
            | WsError::Internal(s)
            | WsError::Server(s) => s.clone(),
            WsError::Io(e) => e.to_string(),
            WsError::Other(e) => e.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, WsError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, WsError::Conflict(_))
    }

    /// Failures a user can fix by changing their configuration. Everything else
    /// is worth an operator's attention and is logged at error level.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            WsError::Infrastructure(_) | WsError::Validation(_) | WsError::BadRequest(_)
        )
    }
}

impl From<serde_yaml_ng::Error> for WsError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        WsError::BadRequest(format!("invalid YAML: {err}"))
    }
}

impl From<serde_json::Error> for WsError {
    fn from(err: serde_json::Error) -> Self {
        WsError::Server(format!("serialization failed: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, WsError>;

/// Fails with `BadRequest` when `value` is empty or only whitespace.
pub fn require_non_empty(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(WsError::bad_request(format!("Required non-empty {what}")));
    }
    Ok(())
}
