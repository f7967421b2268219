//! Workspace snapshot library
//!
//! Snapshot metadata is kept separately from the binary payload it describes:
//! the payload belongs to the infrastructure that produced it, the metadata
//! lives in a [`SnapshotStore`].

pub mod metadata;
pub mod store;

pub use metadata::Snapshot;
pub use store::{FileSnapshotStore, SnapshotStore};
