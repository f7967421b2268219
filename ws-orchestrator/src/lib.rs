//! Workspace lifecycle orchestration
//!
//! This crate holds the runtime registry that drives every workspace through
//! its lifecycle, the manager that exposes workspace operations on top of it,
//! and the persistence and concurrency plumbing both rely on. Embedders build
//! everything through [`WorkspaceEngine::builder`].

pub mod account;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod janitor;
pub mod lock;
pub mod manager;
pub mod pool;
pub mod runtimes;
pub mod status;
pub mod store;
pub mod workspace;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use account::{Account, AccountResolver, StaticAccountResolver};
pub use engine::{WorkspaceEngine, WorkspaceEngineBuilder};
pub use event::{EventBus, EventType, SubscriptionId, WorkspaceEvent, WorkspaceStatusEvent};
pub use lock::KeyedLockTable;
pub use manager::{WorkspaceManager, WorkspaceOperation};
pub use pool::{CountDownLatch, TaskHandle, TaskPool};
pub use runtimes::{StartTask, StopTask, WorkspaceRuntimes};
pub use store::{MemoryWorkspaceStore, SqliteWorkspaceStore, WorkspaceStore};
pub use workspace::{attributes, Runtime, Workspace, WorkspaceStatus};
pub use ws_core::error::{Result, WsError};
