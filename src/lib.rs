//! Bulk catch-up synchronization for a peer-replicated local store.
//!
//! On startup every collection gets a collection-wide subscription. Once
//! those are registered the [`sync::SyncOrchestrator`] asks the remote API
//! how many documents each collection holds and pages through the local
//! replica until that many are visible.

pub mod collections;
pub mod config;
pub mod db;
pub mod peer;
pub mod readiness;
pub mod registry;
pub mod remote;
pub mod server;
pub mod store;
pub mod sync;

pub use collections::CollectionName;
pub use config::{Config, ConfigError};
