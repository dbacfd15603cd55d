//! Values produced and consumed by the sync orchestrator.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::collections::CollectionName;
use crate::config::Config;

/// Lifecycle of one orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    /// Constructed, nothing started.
    Idle,
    /// Waiting for subscriptions to be registered.
    AwaitingReadiness,
    /// Fetching remote counts.
    CountingRemote,
    /// Paging collections from the local replica.
    Syncing,
    /// Last run finished and produced a summary.
    Completed,
    /// Last run aborted in the counting stage.
    Failed,
}

impl std::fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OrchestratorState::Idle => "idle",
            OrchestratorState::AwaitingReadiness => "awaiting_readiness",
            OrchestratorState::CountingRemote => "counting_remote",
            OrchestratorState::Syncing => "syncing",
            OrchestratorState::Completed => "completed",
            OrchestratorState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tunables for a bulk sync run.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    /// Page size (`LIMIT`) for every page request.
    pub batch_size: u64,
    /// Delay between attempts on the same page and between pages.
    pub batch_interval: Duration,
    /// Upper bound on a single remote count or store query call.
    pub call_timeout: Duration,
    /// Predicate applied to remote counts and page queries.
    pub filter: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            batch_interval: Duration::from_millis(1000),
            call_timeout: Duration::from_secs(5),
            filter: "status == 1".to_string(),
        }
    }
}

impl SyncSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.batch_size as u64,
            batch_interval: config.batch_interval(),
            call_timeout: config.call_timeout(),
            filter: config.count_filter.clone(),
        }
    }
}

/// Remote count for one collection.
///
/// A failed count is recorded as zero with the error attached.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionCount {
    pub collection: CollectionName,
    pub count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CollectionCount {
    pub fn ok(collection: CollectionName, count: u64) -> Self {
        Self {
            collection,
            count,
            error: None,
        }
    }

    pub fn failed(collection: CollectionName, error: impl Into<String>) -> Self {
        Self {
            collection,
            count: 0,
            error: Some(error.into()),
        }
    }
}

/// Work item for a single collection sync task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncTarget {
    pub collection: CollectionName,
    pub target_count: u64,
}

/// One page of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub collection: CollectionName,
    pub offset: u64,
    pub limit: u64,
}

impl PageRequest {
    pub fn new(collection: CollectionName, offset: u64, limit: u64) -> Self {
        Self {
            collection,
            offset,
            limit,
        }
    }

    /// Registry key for the page-scoped subscription.
    pub fn subscription_key(&self) -> String {
        format!("{}_batch_{}_{}", self.collection, self.offset, self.limit)
    }

    /// Statement selecting this page.
    pub fn query(&self, filter: &str) -> String {
        format!(
            "SELECT * FROM {} WHERE {} LIMIT {} OFFSET {}",
            self.collection, filter, self.limit, self.offset
        )
    }
}

/// Outcome of syncing one collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncResult {
    pub collection: CollectionName,
    pub synced: u64,
    pub skipped: bool,
    /// Set when the task stopped because of shutdown.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncResult {
    pub fn synced(collection: CollectionName, synced: u64) -> Self {
        Self {
            collection,
            synced,
            skipped: false,
            cancelled: false,
            error: None,
        }
    }

    pub fn skipped(collection: CollectionName, error: Option<String>) -> Self {
        Self {
            collection,
            synced: 0,
            skipped: true,
            cancelled: false,
            error,
        }
    }

    pub fn cancelled(collection: CollectionName, synced: u64) -> Self {
        Self {
            collection,
            synced,
            skipped: false,
            cancelled: true,
            error: None,
        }
    }
}

/// Consolidated result of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncSummary {
    pub results: Vec<SyncResult>,
    pub total: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncSummary {
    pub fn new(results: Vec<SyncResult>, started_at: DateTime<Utc>) -> Self {
        let total = results.iter().map(|r| r.synced).sum();
        Self {
            results,
            total,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Result for `collection`, if it was part of the run.
    pub fn result(&self, collection: CollectionName) -> Option<&SyncResult> {
        self.results.iter().find(|r| r.collection == collection)
    }

    pub fn log(&self) {
        tracing::info!("=== Sync Summary ===");
        for result in &self.results {
            if result.skipped {
                match &result.error {
                    Some(e) => tracing::info!("{}: Skipped (count failed: {})", result.collection, e),
                    None => tracing::info!("{}: Skipped (no documents)", result.collection),
                }
            } else if result.cancelled {
                tracing::info!(
                    "{}: Cancelled after {} documents",
                    result.collection,
                    result.synced
                );
            } else {
                tracing::info!("{}: {} documents synced", result.collection, result.synced);
            }
        }
        tracing::info!("=== End Sync Summary ===");
        tracing::info!(
            "Total documents synced across all collections: {}",
            self.total
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_request_key_and_query() {
        let page = PageRequest::new(CollectionName::Asset, 20_000, 10_000);
        assert_eq!(page.subscription_key(), "Asset_batch_20000_10000");
        assert_eq!(
            page.query("status == 1"),
            "SELECT * FROM Asset WHERE status == 1 LIMIT 10000 OFFSET 20000"
        );
    }

    #[test]
    fn test_summary_total_is_sum_of_results() {
        let summary = SyncSummary::new(
            vec![
                SyncResult::synced(CollectionName::Asset, 25_000),
                SyncResult::skipped(CollectionName::Issue, None),
                SyncResult::synced(CollectionName::Plant, 5),
                SyncResult::cancelled(CollectionName::User, 7),
            ],
            Utc::now(),
        );
        assert_eq!(summary.total, 25_012);
        assert!(summary.finished_at >= summary.started_at);
        assert!(summary.result(CollectionName::Issue).unwrap().skipped);
        assert!(summary.result(CollectionName::ErpMasterData).is_none());
    }

    #[test]
    fn test_result_serialization_omits_defaults() {
        let json = serde_json::to_value(SyncResult::synced(CollectionName::Plant, 5)).unwrap();
        assert_eq!(json["collection"], "Plant");
        assert_eq!(json["synced"], 5);
        assert!(json.get("cancelled").is_none());
        assert!(json.get("error").is_none());

        let json = serde_json::to_value(SyncResult::skipped(
            CollectionName::Asset,
            Some("timeout".into()),
        ))
        .unwrap();
        assert_eq!(json["skipped"], true);
        assert_eq!(json["error"], "timeout");
    }

    #[test]
    fn test_settings_from_config() {
        let config = Config {
            batch_size: 250,
            batch_interval_ms: 50,
            ..Config::default()
        };
        let settings = SyncSettings::from_config(&config);
        assert_eq!(settings.batch_size, 250);
        assert_eq!(settings.batch_interval, Duration::from_millis(50));
        assert_eq!(settings.filter, "status == 1");
    }
}
