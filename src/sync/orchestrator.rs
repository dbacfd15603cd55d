//! Bulk catch-up sync across all collections.
//!
//! A run has two stages:
//! 1. Count: ask the remote source how many documents each collection holds.
//! 2. Sync: for each non-empty collection, page through the local replica
//!    until that many documents are visible, registering a page-scoped
//!    subscription first so the replication layer prioritizes the page.
//!
//! Collections are counted and synced concurrently; pages within one
//! collection are strictly sequential. An empty or failed page is retried
//! after `batch_interval` until data arrives or the orchestrator shuts down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::error::SyncError;
use super::types::{
    CollectionCount, OrchestratorState, PageRequest, SyncResult, SyncSettings, SyncSummary,
    SyncTarget,
};
use crate::collections::CollectionName;
use crate::readiness::ReadinessSignal;
use crate::registry::SubscriptionRegistry;
use crate::remote::RemoteCountProvider;
use crate::store::LocalStore;

/// Drives the bulk sync once subscriptions are in place.
pub struct SyncOrchestrator {
    remote: Arc<dyn RemoteCountProvider>,
    store: Arc<dyn LocalStore>,
    registry: Arc<SubscriptionRegistry>,
    readiness: ReadinessSignal,
    settings: SyncSettings,
    collections: Vec<CollectionName>,

    state_tx: watch::Sender<OrchestratorState>,
    shutdown_tx: watch::Sender<bool>,

    /// Set by the first readiness-triggered start; later starts are ignored.
    started: AtomicBool,
    /// Held for the duration of a run.
    run_lock: Mutex<()>,
    last_summary: RwLock<Option<SyncSummary>>,
}

impl SyncOrchestrator {
    pub fn new(
        remote: Arc<dyn RemoteCountProvider>,
        store: Arc<dyn LocalStore>,
        registry: Arc<SubscriptionRegistry>,
        readiness: ReadinessSignal,
        settings: SyncSettings,
    ) -> Self {
        let (state_tx, _) = watch::channel(OrchestratorState::Idle);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            remote,
            store,
            registry,
            readiness,
            settings,
            collections: CollectionName::ALL.to_vec(),
            state_tx,
            shutdown_tx,
            started: AtomicBool::new(false),
            run_lock: Mutex::new(()),
            last_summary: RwLock::new(None),
        }
    }

    /// Current state.
    pub fn state(&self) -> OrchestratorState {
        *self.state_tx.borrow()
    }

    /// Receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<OrchestratorState> {
        self.state_tx.subscribe()
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn readiness(&self) -> &ReadinessSignal {
        &self.readiness
    }

    /// Summary of the most recent completed run.
    pub async fn last_summary(&self) -> Option<SyncSummary> {
        self.last_summary.read().await.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn set_state(&self, state: OrchestratorState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Orchestrator state changed");
        }
    }

    /// Runs one sync as soon as the readiness signal is set.
    ///
    /// Only the first call proceeds; later calls return `Ok(None)` without
    /// waiting. Returns [`SyncError::ShutDown`] if shutdown happens first.
    pub async fn run_when_ready(&self) -> Result<Option<SyncSummary>, SyncError> {
        if self.started.swap(true, Ordering::SeqCst) {
            info!("Sync already initialized, ignoring readiness trigger");
            return Ok(None);
        }

        let mut observer = self.readiness.subscribe();
        if observer.current() {
            info!("Subscriptions already registered, initializing sync immediately...");
        } else {
            info!("Waiting for subscriptions to be registered...");
            self.set_state(OrchestratorState::AwaitingReadiness);

            let mut shutdown_rx = self.shutdown_tx.subscribe();
            let ready = tokio::select! {
                ready = observer.wait_ready() => ready,
                _ = shutdown_rx.wait_for(|stop| *stop) => false,
            };
            if !ready {
                info!("Stopped waiting for subscriptions");
                return Err(SyncError::ShutDown);
            }
            info!("Received subscriptions registered event, initializing sync...");
        }
        observer.unsubscribe();

        self.run_now().await.map(Some)
    }

    /// Runs the counting and syncing stages immediately.
    pub async fn run_now(&self) -> Result<SyncSummary, SyncError> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| SyncError::AlreadyRunning)?;

        if self.is_shut_down() {
            return Err(SyncError::ShutDown);
        }

        info!("Initializing sync process...");
        let started_at = Utc::now();

        self.set_state(OrchestratorState::CountingRemote);
        let counts = match self.collection_counts().await {
            Ok(counts) => counts,
            Err(e) => {
                error!(error = %e, "Failed to initialize sync");
                self.set_state(OrchestratorState::Failed);
                return Err(e);
            }
        };

        self.set_state(OrchestratorState::Syncing);
        let results = self.sync_all(&counts).await;

        let summary = SyncSummary::new(results, started_at);
        summary.log();

        *self.last_summary.write().await = Some(summary.clone());
        self.set_state(OrchestratorState::Completed);
        info!("Sync initialization completed successfully");

        Ok(summary)
    }

    /// Fetches remote counts for every collection concurrently.
    ///
    /// A failing collection is recorded with count 0 and its error. When no
    /// collection could reach the remote at all, the run fails with
    /// [`SyncError::RemoteUnavailable`].
    pub async fn collection_counts(&self) -> Result<Vec<CollectionCount>, SyncError> {
        if !self.remote.is_available() {
            return Err(SyncError::RemoteUnavailable);
        }

        let filter = self.settings.filter.as_str();
        let call_timeout = self.settings.call_timeout;

        // Each outcome also records whether the remote was unreachable
        let requests = self.collections.iter().map(|&collection| async move {
            match timeout(call_timeout, self.remote.get_count(filter, collection)).await {
                Ok(Ok(count)) => (CollectionCount::ok(collection, count), false),
                Ok(Err(e)) => {
                    error!(collection = %collection, error = %e, "Failed to get count for collection");
                    (
                        CollectionCount::failed(collection, e.to_string()),
                        e.is_unreachable(),
                    )
                }
                Err(_) => {
                    error!(collection = %collection, "Timed out getting count for collection");
                    (
                        CollectionCount::failed(
                            collection,
                            format!("timed out after {} ms", call_timeout.as_millis()),
                        ),
                        true,
                    )
                }
            }
        });
        let outcomes = join_all(requests).await;
        let unreachable = !outcomes.is_empty() && outcomes.iter().all(|(_, unreachable)| *unreachable);
        let counts: Vec<CollectionCount> = outcomes.into_iter().map(|(count, _)| count).collect();

        info!("=== Collection Counts Summary ===");
        for count in &counts {
            match &count.error {
                None => info!("{}: {} documents", count.collection, count.count),
                Some(e) => error!("{}: Failed - {}", count.collection, e),
            }
        }
        info!("=== End Summary ===");

        if unreachable {
            error!("Remote API unreachable for every collection");
            return Err(SyncError::RemoteUnavailable);
        }

        let total: u64 = counts.iter().map(|c| c.count).sum();
        info!("Total documents across all collections: {}", total);

        Ok(counts)
    }

    /// Syncs every collection with a non-zero count concurrently.
    ///
    /// Zero-count collections are reported as skipped without touching the
    /// local store. Results come back in the order of `counts`.
    pub async fn sync_all(&self, counts: &[CollectionCount]) -> Vec<SyncResult> {
        info!("Starting to sync all collections...");

        let tasks = counts.iter().map(|count| async move {
            if count.count > 0 {
                info!(
                    "Syncing collection: {} ({} documents)",
                    count.collection, count.count
                );
                self.sync_collection(SyncTarget {
                    collection: count.collection,
                    target_count: count.count,
                })
                .await
            } else {
                info!("Skipping collection: {} (no documents)", count.collection);
                SyncResult::skipped(count.collection, count.error.clone())
            }
        });

        join_all(tasks).await
    }

    /// Pages through one collection until `target_count` documents were seen.
    pub async fn sync_collection(&self, target: SyncTarget) -> SyncResult {
        let SyncTarget {
            collection,
            target_count,
        } = target;
        let batch_size = self.settings.batch_size;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        info!(
            "Starting sync for collection: {} ({} total documents)",
            collection, target_count
        );

        let mut synced = 0u64;
        let mut offset = 0u64;

        while synced < target_count {
            let page = PageRequest::new(collection, offset, batch_size);
            info!(
                collection = %collection,
                offset,
                limit = batch_size,
                "Fetching batch"
            );

            let key = page.subscription_key();
            match self
                .registry
                .register(&key, &page.query(&self.settings.filter))
                .await
            {
                Ok(()) => debug!(key = %key, "Registered subscription for batch"),
                // The page may still arrive through the collection-wide subscription
                Err(e) => warn!(key = %key, error = %e, "Failed to register batch subscription"),
            }

            let fetched = match self.fetch_page(&page, &mut shutdown_rx).await {
                Some(fetched) => fetched,
                None => {
                    info!(
                        collection = %collection,
                        synced,
                        "Sync cancelled by shutdown"
                    );
                    return SyncResult::cancelled(collection, synced);
                }
            };

            synced += fetched;
            offset += batch_size;
            info!(
                "Fetched {} records from {}. Total synced: {}/{}",
                fetched, collection, synced, target_count
            );

            if synced < target_count {
                debug!(
                    "Waiting {}ms before next batch...",
                    self.settings.batch_interval.as_millis()
                );
                if !self.pause(&mut shutdown_rx).await {
                    return SyncResult::cancelled(collection, synced);
                }
            }
        }

        info!(
            "Completed sync for {}: {} documents synced",
            collection, synced
        );
        SyncResult::synced(collection, synced)
    }

    /// Queries one page until it returns data.
    ///
    /// Empty pages, errors and timeouts are retried after `batch_interval`.
    /// Returns the number of records, or `None` on shutdown.
    async fn fetch_page(
        &self,
        page: &PageRequest,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Option<u64> {
        let query = page.query(&self.settings.filter);
        let interval_ms = self.settings.batch_interval.as_millis();
        let mut attempt = 0u32;

        loop {
            if *shutdown_rx.borrow() {
                return None;
            }
            attempt += 1;

            debug!(query = %query, "Executing query");
            match timeout(self.settings.call_timeout, self.store.query(&query)).await {
                Ok(Ok(result)) if !result.is_empty() => {
                    info!(
                        "Successfully fetched {} records from {} at offset {} (attempt {})",
                        result.len(),
                        page.collection,
                        page.offset,
                        attempt
                    );
                    return Some(result.len() as u64);
                }
                Ok(Ok(_)) => {
                    info!(
                        "No data available for {} at offset {} (attempt {}), retrying in {}ms...",
                        page.collection, page.offset, attempt, interval_ms
                    );
                }
                Ok(Err(e)) => {
                    error!(
                        collection = %page.collection,
                        offset = page.offset,
                        attempt,
                        error = %e,
                        "Failed to fetch batch, retrying in {}ms...",
                        interval_ms
                    );
                }
                Err(_) => {
                    warn!(
                        collection = %page.collection,
                        offset = page.offset,
                        attempt,
                        "Batch query timed out, retrying in {}ms...",
                        interval_ms
                    );
                }
            }

            if !self.pause(shutdown_rx).await {
                return None;
            }
        }
    }

    /// Sleeps for `batch_interval`. Returns `false` if shutdown interrupted it.
    async fn pause(&self, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            biased;
            _ = shutdown_rx.wait_for(|stop| *stop) => false,
            _ = tokio::time::sleep(self.settings.batch_interval) => true,
        }
    }

    /// Stops waiting tasks and page retry loops, then cancels every
    /// registered subscription.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            debug!("Orchestrator already shut down");
        }
        let cancelled = self.registry.cancel_all().await;
        info!(cancelled, "Sync orchestrator shut down");
    }
}
