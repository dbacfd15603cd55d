//! SQLite-backed local replica.
//!
//! Documents live in one table per collection (see `migrations/`). The
//! replica also tracks the set of active subscription queries, which the
//! peer link advertises to the remote side.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use tokio::sync::watch;
use uuid::Uuid;

use super::{LocalStore, QueryResult, StoreError, SubscriptionApi, SubscriptionHandle};
use crate::collections::CollectionName;
use crate::db::init_db;

struct StoreState {
    connected: AtomicBool,
    /// Active subscriptions keyed by handle id.
    subscriptions: watch::Sender<BTreeMap<Uuid, String>>,
}

/// The local replica.
///
/// Cheap to clone; clones share the pool and subscription set.
#[derive(Clone)]
pub struct ReplicaStore {
    pool: SqlitePool,
    state: Arc<StoreState>,
}

impl ReplicaStore {
    /// Opens (or creates) the replica at `path`. The store starts stopped.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let pool = init_db(path).await?;
        Ok(Self::from_pool(pool))
    }

    /// Wraps an already migrated pool.
    pub fn from_pool(pool: SqlitePool) -> Self {
        let (subscriptions, _) = watch::channel(BTreeMap::new());
        Self {
            pool,
            state: Arc::new(StoreState {
                connected: AtomicBool::new(false),
                subscriptions,
            }),
        }
    }

    /// Marks the replica as serving queries.
    pub fn start_sync(&self) {
        self.state.connected.store(true, Ordering::SeqCst);
        tracing::info!("Local replica started");
    }

    /// Marks the replica as stopped; queries fail with [`StoreError::NotConnected`].
    pub fn stop_sync(&self) {
        self.state.connected.store(false, Ordering::SeqCst);
        tracing::info!("Local replica stopped");
    }

    /// Distinct queries currently subscribed, sorted.
    pub fn active_subscriptions(&self) -> Vec<String> {
        let mut queries: Vec<String> = self.state.subscriptions.borrow().values().cloned().collect();
        queries.sort();
        queries.dedup();
        queries
    }

    /// Receiver notified whenever the subscription set changes.
    pub fn subscriptions_receiver(&self) -> watch::Receiver<BTreeMap<Uuid, String>> {
        self.state.subscriptions.subscribe()
    }

    /// Inserts or replaces a document.
    ///
    /// The `status` column is taken from `value.status` when it is an integer.
    pub async fn upsert(
        &self,
        collection: CollectionName,
        id: &str,
        value: &Value,
    ) -> Result<(), StoreError> {
        let status = value.get("status").and_then(Value::as_i64).unwrap_or(0);
        let body = value.to_string();
        let updated_at = Utc::now().to_rfc3339();

        let sql = format!(
            r#"
            INSERT INTO {} (_id, status, value, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(_id) DO UPDATE SET
                status = excluded.status,
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            collection.as_str()
        );

        sqlx::query(&sql)
            .bind(id)
            .bind(status)
            .bind(&body)
            .bind(&updated_at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Removes a document. Returns whether a row was deleted.
    pub async fn remove(&self, collection: CollectionName, id: &str) -> Result<bool, StoreError> {
        let sql = format!("DELETE FROM {} WHERE _id = ?", collection.as_str());
        let result = sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }
}

impl LocalStore for ReplicaStore {
    fn query(&self, query: &str) -> BoxFuture<'_, Result<QueryResult, StoreError>> {
        let query = query.to_string();
        async move {
            if !self.is_connected() {
                return Err(StoreError::NotConnected);
            }

            let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
            let items = rows.iter().map(row_to_json).collect();

            Ok(QueryResult { items })
        }
        .boxed()
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }
}

impl SubscriptionApi for ReplicaStore {
    fn register_subscription(
        &self,
        query: &str,
    ) -> Result<Box<dyn SubscriptionHandle>, StoreError> {
        if query.trim().is_empty() {
            return Err(StoreError::Subscription("empty subscription query".to_string()));
        }

        let id = Uuid::new_v4();
        self.state.subscriptions.send_modify(|subs| {
            subs.insert(id, query.to_string());
        });

        Ok(Box::new(ReplicaSubscription {
            id,
            query: query.to_string(),
            cancelled: AtomicBool::new(false),
            state: Arc::clone(&self.state),
        }))
    }
}

/// Handle for a subscription registered on a [`ReplicaStore`].
pub struct ReplicaSubscription {
    id: Uuid,
    query: String,
    cancelled: AtomicBool,
    state: Arc<StoreState>,
}

impl SubscriptionHandle for ReplicaSubscription {
    fn query(&self) -> &str {
        &self.query
    }

    fn cancel(&self) -> Result<(), StoreError> {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.state.subscriptions.send_modify(|subs| {
            subs.remove(&self.id);
        });
        Ok(())
    }
}

/// Converts a row into a JSON object keyed by column name.
///
/// The `value` column holds document JSON and is decoded rather than
/// returned as a string.
fn row_to_json(row: &SqliteRow) -> Value {
    let mut object = serde_json::Map::new();

    for column in row.columns() {
        let index = column.ordinal();
        let name = column.name();

        let value = match row.try_get_raw(index) {
            Ok(raw) if raw.is_null() => Value::Null,
            Ok(raw) => {
                let type_name = raw.type_info().name().to_uppercase();
                match type_name.as_str() {
                    "INTEGER" | "BOOLEAN" | "INT8" | "BIGINT" => row
                        .try_get::<i64, _>(index)
                        .map(Value::from)
                        .unwrap_or(Value::Null),
                    "REAL" => row
                        .try_get::<f64, _>(index)
                        .map(Value::from)
                        .unwrap_or(Value::Null),
                    "BLOB" => row
                        .try_get::<Vec<u8>, _>(index)
                        .map(Value::from)
                        .unwrap_or(Value::Null),
                    _ => match row.try_get::<String, _>(index) {
                        Ok(text) if name == "value" => {
                            serde_json::from_str(&text).unwrap_or(Value::String(text))
                        }
                        Ok(text) => Value::String(text),
                        Err(_) => Value::Null,
                    },
                }
            }
            Err(_) => Value::Null,
        };

        object.insert(name.to_string(), value);
    }

    Value::Object(object)
}
