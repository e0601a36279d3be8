//! Strata Metadata Store - coordination directory
//!
//! Snapshot records, recovery tasks and datasets persisted in redb. The
//! indexer only sees the [`CoordinationDirectory`] trait.

pub mod directory;
pub mod store;
pub mod tables;

// Re-exports
pub use directory::CoordinationDirectory;
pub use store::{MetaStore, MetaStoreError};
