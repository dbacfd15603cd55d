//! Sync orchestrator error types.

use thiserror::Error;

/// Errors that abort a sync run.
///
/// Per-collection problems never surface here: failed counts and failed
/// page queries are absorbed into the run's [`SyncSummary`](super::SyncSummary).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The remote count source cannot be used at all: the local replica is
    /// stopped or no count request reached the remote API.
    #[error("Remote count source unavailable")]
    RemoteUnavailable,
    /// Another run holds the orchestrator.
    #[error("A sync run is already in progress")]
    AlreadyRunning,
    /// The orchestrator was shut down before or while waiting to run.
    #[error("Sync orchestrator has been shut down")]
    ShutDown,
}
