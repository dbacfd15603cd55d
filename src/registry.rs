//! Registry of live-sync subscriptions.
//!
//! The registry is the sole owner of every [`SubscriptionHandle`] it creates.
//! Entries are keyed either by collection name (the collection-wide
//! subscriptions registered at startup) or by an arbitrary query key such as
//! the per-page keys used during bulk sync.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::collections::CollectionName;
use crate::store::{StoreError, SubscriptionApi, SubscriptionHandle};

/// Tracks active subscriptions by key.
///
/// All mutations go through a single lock, so a `cancel_all` sweep and
/// concurrent `register` calls from sync tasks never interleave.
pub struct SubscriptionRegistry {
    api: Arc<dyn SubscriptionApi>,
    subscriptions: Mutex<BTreeMap<String, Box<dyn SubscriptionHandle>>>,
}

impl SubscriptionRegistry {
    pub fn new(api: Arc<dyn SubscriptionApi>) -> Self {
        Self {
            api,
            subscriptions: Mutex::new(BTreeMap::new()),
        }
    }

    /// Registers `query` under `key`.
    ///
    /// Registering an existing key cancels the previous subscription before
    /// the new one is created.
    pub async fn register(&self, key: &str, query: &str) -> Result<(), StoreError> {
        let mut subscriptions = self.subscriptions.lock().await;

        if let Some(previous) = subscriptions.remove(key) {
            if let Err(e) = previous.cancel() {
                tracing::warn!(key, error = %e, "Failed to cancel replaced subscription");
            }
        }

        let handle = self.api.register_subscription(query).map_err(|e| {
            tracing::error!(key, query, error = %e, "Failed to register subscription");
            e
        })?;
        subscriptions.insert(key.to_string(), handle);

        tracing::debug!(key, query, "Registered subscription");
        Ok(())
    }

    /// Registers the collection-wide subscription for every collection.
    pub async fn register_all(&self, collections: &[CollectionName]) -> Result<(), StoreError> {
        tracing::info!("Registering sync subscriptions for all collections...");

        for collection in collections {
            self.register(collection.as_str(), &collection.subscription_query())
                .await?;
            tracing::info!(collection = %collection, "Registered sync subscription");
        }

        tracing::info!(
            "Successfully registered {} sync subscriptions",
            collections.len()
        );
        Ok(())
    }

    /// Cancels and removes the subscription under `key`.
    ///
    /// Returns `Ok(false)` if no such subscription exists.
    pub async fn cancel(&self, key: &str) -> Result<bool, StoreError> {
        let mut subscriptions = self.subscriptions.lock().await;

        match subscriptions.remove(key) {
            Some(handle) => {
                handle.cancel()?;
                tracing::info!(key, "Cancelled subscription");
                Ok(true)
            }
            None => {
                tracing::warn!(key, "No subscription found");
                Ok(false)
            }
        }
    }

    /// Cancels every subscription, continuing past individual failures.
    ///
    /// Returns the number of subscriptions cancelled successfully. The
    /// registry is empty afterwards either way.
    pub async fn cancel_all(&self) -> usize {
        let mut subscriptions = self.subscriptions.lock().await;
        tracing::info!(
            "Cancelling all sync subscriptions ({})...",
            subscriptions.len()
        );

        let mut cancelled = 0;
        for (key, handle) in std::mem::take(&mut *subscriptions) {
            match handle.cancel() {
                Ok(()) => {
                    cancelled += 1;
                    tracing::debug!(key = %key, "Cancelled subscription");
                }
                Err(e) => {
                    tracing::error!(key = %key, error = %e, "Failed to cancel subscription");
                }
            }
        }

        tracing::info!("Cancelled {} subscription(s)", cancelled);
        cancelled
    }

    pub async fn count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }

    pub async fn has(&self, key: &str) -> bool {
        self.subscriptions.lock().await.contains_key(key)
    }

    /// Query text registered under `key`.
    pub async fn get(&self, key: &str) -> Option<String> {
        self.subscriptions
            .lock()
            .await
            .get(key)
            .map(|handle| handle.query().to_string())
    }

    /// Registered keys, sorted.
    pub async fn keys(&self) -> Vec<String> {
        self.subscriptions.lock().await.keys().cloned().collect()
    }
}
