//! Bulk catch-up synchronization.
//!
//! [`SyncOrchestrator`] waits on the [`ReadinessSignal`](crate::readiness::ReadinessSignal),
//! fetches authoritative counts for every collection and pages the local
//! replica until each collection reaches its count. See
//! [`orchestrator`] for the algorithm.

mod error;
pub mod orchestrator;
mod types;

pub use error::SyncError;
pub use orchestrator::SyncOrchestrator;
pub use types::{
    CollectionCount, OrchestratorState, PageRequest, SyncResult, SyncSettings, SyncSummary,
    SyncTarget,
};
