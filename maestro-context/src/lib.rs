//! ABOUTME: Workflow context store for maestro
//! ABOUTME: Dotted-path state per execution, deep-merge, snapshots, TTL

pub mod store;
pub mod types;

pub use store::{ContextStore, ContextStoreConfig};
pub use types::{ContextSnapshot, SnapshotInfo, WorkflowContext};
