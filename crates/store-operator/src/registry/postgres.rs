// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL store registry.
//!
//! Records live in the `stores` table. Conditional writes compare
//! `resource_version` in the `WHERE` clause; a trigger publishes every row
//! change on the `store_changes` channel, which [`PostgresRegistry::listen`]
//! forwards to subscribers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::{Notify, broadcast};
use tracing::{debug, info, warn};

use super::*;

/// Notification channel fed by the `stores_notify` trigger.
pub const CHANGE_CHANNEL: &str = "store_changes";

#[derive(Debug, sqlx::FromRow)]
struct StoreRow {
    store_id: String,
    engine: String,
    options: serde_json::Value,
    status: Option<serde_json::Value>,
    finalizer_present: bool,
    deletion_requested_at: Option<DateTime<Utc>>,
    retry_generation: i64,
    generation: i64,
    resource_version: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<StoreRow> for StoreRecord {
    type Error = RegistryError;

    fn try_from(row: StoreRow) -> Result<Self> {
        let store_id =
            StoreId::parse(row.store_id).map_err(|e| RegistryError::Corrupt(e.to_string()))?;
        let options = match row.options {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                return Err(RegistryError::Corrupt(format!(
                    "options of {store_id} is not an object: {other}"
                )));
            }
        };
        let status = row.status.map(serde_json::from_value).transpose()?;

        Ok(StoreRecord {
            spec: StoreSpec {
                store_id,
                engine: row.engine,
                options,
            },
            status,
            finalizer_present: row.finalizer_present,
            deletion_requested_at: row.deletion_requested_at,
            retry_generation: row.retry_generation,
            generation: row.generation,
            resource_version: row.resource_version,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChangePayload {
    store_id: String,
    deletion_requested: bool,
}

const SELECT_COLUMNS: &str = r#"
    SELECT store_id, engine, options, status, finalizer_present, deletion_requested_at,
           retry_generation, generation, resource_version, created_at
    FROM stores
"#;

/// Registry backed by PostgreSQL.
#[derive(Clone)]
pub struct PostgresRegistry {
    pool: PgPool,
    changes: broadcast::Sender<StoreChange>,
}

impl PostgresRegistry {
    /// Create a registry over an existing pool. Run [`crate::migrations::run`] first.
    pub fn new(pool: PgPool) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { pool, changes }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Forward `store_changes` notifications to subscribers until shutdown.
    ///
    /// The listener reconnects on connection loss; notifications sent while
    /// disconnected are lost, which the controller's periodic resync covers.
    pub async fn listen(&self, shutdown: Arc<Notify>) -> Result<()> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CHANGE_CHANNEL).await?;
        info!(channel = CHANGE_CHANNEL, "Listening for store changes");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.notified() => {
                    info!("Store change listener shutting down");
                    break;
                }

                notification = listener.recv() => {
                    match notification {
                        Ok(notification) => self.forward(notification.payload()),
                        Err(e) => {
                            warn!(error = %e, "Store change listener error, retrying");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn forward(&self, payload: &str) {
        let parsed = serde_json::from_str::<ChangePayload>(payload)
            .map_err(|e| e.to_string())
            .and_then(|p| {
                StoreId::parse(p.store_id)
                    .map(|store_id| StoreChange {
                        store_id,
                        deletion_requested: p.deletion_requested,
                    })
                    .map_err(|e| e.to_string())
            });
        match parsed {
            Ok(change) => {
                debug!(store_id = %change.store_id, "Store change notification");
                let _ = self.changes.send(change);
            }
            Err(e) => warn!(payload, error = %e, "Ignoring malformed store change notification"),
        }
    }

    async fn exists(&self, store_id: &StoreId) -> Result<bool> {
        let found: Option<(String,)> =
            sqlx::query_as("SELECT store_id FROM stores WHERE store_id = $1")
                .bind(store_id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    /// Map a zero-row conditional write to `NotFound` or `Conflict`.
    async fn missed_write(&self, store_id: &StoreId, expected: i64) -> RegistryError {
        match self.exists(store_id).await {
            Ok(true) => RegistryError::Conflict {
                store_id: store_id.clone(),
                expected,
            },
            Ok(false) => RegistryError::NotFound(store_id.clone()),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl StoreRegistry for PostgresRegistry {
    async fn get(&self, store_id: &StoreId) -> Result<Option<StoreRecord>> {
        let query = format!("{SELECT_COLUMNS} WHERE store_id = $1");
        let row: Option<StoreRow> = sqlx::query_as(&query)
            .bind(store_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(StoreRecord::try_from).transpose()
    }

    async fn list(&self) -> Result<Vec<StoreRecord>> {
        let query = format!("{SELECT_COLUMNS} ORDER BY store_id");
        let rows: Vec<StoreRow> = sqlx::query_as(&query).fetch_all(&self.pool).await?;
        rows.into_iter().map(StoreRecord::try_from).collect()
    }

    async fn create(&self, spec: &StoreSpec) -> Result<StoreRecord> {
        let query = r#"
            INSERT INTO stores (store_id, engine, options)
            VALUES ($1, $2, $3)
            ON CONFLICT (store_id) DO NOTHING
            RETURNING store_id, engine, options, status, finalizer_present, deletion_requested_at,
                      retry_generation, generation, resource_version, created_at
        "#;
        let row: Option<StoreRow> = sqlx::query_as(query)
            .bind(spec.store_id.as_str())
            .bind(&spec.engine)
            .bind(serde_json::Value::Object(spec.options.clone()))
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => StoreRecord::try_from(row),
            None => Err(RegistryError::AlreadyExists(spec.store_id.clone())),
        }
    }

    async fn update_status(
        &self,
        store_id: &StoreId,
        expected_version: i64,
        status: &StoreStatus,
    ) -> Result<i64> {
        let status = serde_json::to_value(status)?;
        let updated: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE stores
            SET status = $3, resource_version = resource_version + 1
            WHERE store_id = $1 AND resource_version = $2
            RETURNING resource_version
            "#,
        )
        .bind(store_id.as_str())
        .bind(expected_version)
        .bind(status)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some((version,)) => Ok(version),
            None => Err(self.missed_write(store_id, expected_version).await),
        }
    }

    async fn set_finalizer(
        &self,
        store_id: &StoreId,
        expected_version: i64,
        present: bool,
    ) -> Result<i64> {
        let updated: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE stores
            SET finalizer_present = $3, resource_version = resource_version + 1
            WHERE store_id = $1 AND resource_version = $2
            RETURNING resource_version
            "#,
        )
        .bind(store_id.as_str())
        .bind(expected_version)
        .bind(present)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some((version,)) => Ok(version),
            None => Err(self.missed_write(store_id, expected_version).await),
        }
    }

    async fn request_delete(&self, store_id: &StoreId) -> Result<DeleteIntent> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(bool,)> =
            sqlx::query_as("SELECT finalizer_present FROM stores WHERE store_id = $1 FOR UPDATE")
                .bind(store_id.as_str())
                .fetch_optional(&mut *tx)
                .await?;

        let intent = match current {
            None => DeleteIntent::NotFound,
            Some((false,)) => {
                sqlx::query("DELETE FROM stores WHERE store_id = $1")
                    .bind(store_id.as_str())
                    .execute(&mut *tx)
                    .await?;
                DeleteIntent::Removed
            }
            Some((true,)) => {
                sqlx::query(
                    r#"
                    UPDATE stores
                    SET deletion_requested_at = NOW(), resource_version = resource_version + 1
                    WHERE store_id = $1 AND deletion_requested_at IS NULL
                    "#,
                )
                .bind(store_id.as_str())
                .execute(&mut *tx)
                .await?;
                DeleteIntent::Pending
            }
        };

        tx.commit().await?;
        Ok(intent)
    }

    async fn request_retry(&self, store_id: &StoreId) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE stores
            SET retry_generation = retry_generation + 1,
                generation = generation + 1,
                resource_version = resource_version + 1
            WHERE store_id = $1
            "#,
        )
        .bind(store_id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(store_id.clone()));
        }
        Ok(())
    }

    async fn remove(&self, store_id: &StoreId) -> Result<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM stores
            WHERE store_id = $1 AND NOT finalizer_present AND deletion_requested_at IS NOT NULL
            "#,
        )
        .bind(store_id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 && self.exists(store_id).await? {
            return Err(RegistryError::RemovalBlocked(store_id.clone()));
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}
