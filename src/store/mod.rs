//! Ports onto the local replica.
//!
//! The orchestrator and registry only see the two traits defined here:
//! [`LocalStore`] for running queries against the replica and
//! [`SubscriptionApi`] for telling the replication layer which data to
//! prioritize. [`ReplicaStore`] is the SQLite-backed implementation used by
//! the binary; tests substitute in-memory fakes.

mod replica;

pub use replica::{ReplicaStore, ReplicaSubscription};

use futures::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;

/// Rows returned by a store query, one JSON object per row.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub items: Vec<serde_json::Value>,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Errors raised by the local replica.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The replica has not been started or was stopped.
    #[error("Local store is not connected")]
    NotConnected,
    /// Query failed to execute.
    #[error("Query failed: {0}")]
    Query(#[from] sqlx::Error),
    /// The subscription could not be registered or cancelled.
    #[error("Subscription error: {0}")]
    Subscription(String),
}

/// Query execution against the local replica.
pub trait LocalStore: Send + Sync + 'static {
    /// Execute a SELECT-style statement and return the matching rows.
    fn query(&self, query: &str) -> BoxFuture<'_, Result<QueryResult, StoreError>>;

    /// Whether the replica is started and able to serve queries.
    fn is_connected(&self) -> bool {
        true
    }
}

/// A live registration with the replication layer.
pub trait SubscriptionHandle: Send + Sync {
    /// The query this subscription covers.
    fn query(&self) -> &str;

    /// Stop replicating data for this subscription. Cancelling twice is a no-op.
    fn cancel(&self) -> Result<(), StoreError>;
}

/// Subscription registration on the local replica.
pub trait SubscriptionApi: Send + Sync + 'static {
    fn register_subscription(&self, query: &str)
        -> Result<Box<dyn SubscriptionHandle>, StoreError>;
}
