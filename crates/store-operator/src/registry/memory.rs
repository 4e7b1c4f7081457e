// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory store registry.
//!
//! Mirrors the PostgreSQL registry's semantics (conditional writes,
//! finalizer-gated removal, change notifications) without a database.
//! Used by tests and local runs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, broadcast};

use super::*;

/// In-memory registry.
pub struct InMemoryRegistry {
    records: Arc<Mutex<BTreeMap<StoreId, StoreRecord>>>,
    changes: broadcast::Sender<StoreChange>,
    status_writes: AtomicU64,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            records: Arc::new(Mutex::new(BTreeMap::new())),
            changes,
            status_writes: AtomicU64::new(0),
        }
    }

    /// Insert or replace a record verbatim, bypassing version checks.
    ///
    /// Lets tests seed state left behind by an earlier controller process.
    pub async fn seed(&self, record: StoreRecord) {
        let change = StoreChange {
            store_id: record.store_id().clone(),
            deletion_requested: record.is_deleting(),
        };
        self.records
            .lock()
            .await
            .insert(record.store_id().clone(), record);
        let _ = self.changes.send(change);
    }

    /// Number of successful status writes.
    pub fn status_writes(&self) -> u64 {
        self.status_writes.load(Ordering::SeqCst)
    }

    fn notify(&self, record: &StoreRecord) {
        // No receivers is fine.
        let _ = self.changes.send(StoreChange {
            store_id: record.store_id().clone(),
            deletion_requested: record.is_deleting(),
        });
    }
}

#[async_trait]
impl StoreRegistry for InMemoryRegistry {
    async fn get(&self, store_id: &StoreId) -> Result<Option<StoreRecord>> {
        Ok(self.records.lock().await.get(store_id).cloned())
    }

    async fn list(&self) -> Result<Vec<StoreRecord>> {
        Ok(self.records.lock().await.values().cloned().collect())
    }

    async fn create(&self, spec: &StoreSpec) -> Result<StoreRecord> {
        let record = {
            let mut records = self.records.lock().await;
            if records.contains_key(&spec.store_id) {
                return Err(RegistryError::AlreadyExists(spec.store_id.clone()));
            }
            let record = StoreRecord {
                spec: spec.clone(),
                status: None,
                finalizer_present: false,
                deletion_requested_at: None,
                retry_generation: 0,
                generation: 1,
                resource_version: 1,
                created_at: Utc::now(),
            };
            records.insert(spec.store_id.clone(), record.clone());
            record
        };
        self.notify(&record);
        Ok(record)
    }

    async fn update_status(
        &self,
        store_id: &StoreId,
        expected_version: i64,
        status: &StoreStatus,
    ) -> Result<i64> {
        let record = {
            let mut records = self.records.lock().await;
            let record = records
                .get_mut(store_id)
                .ok_or_else(|| RegistryError::NotFound(store_id.clone()))?;
            if record.resource_version != expected_version {
                return Err(RegistryError::Conflict {
                    store_id: store_id.clone(),
                    expected: expected_version,
                });
            }
            record.status = Some(status.clone());
            record.resource_version += 1;
            record.clone()
        };
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        self.notify(&record);
        Ok(record.resource_version)
    }

    async fn set_finalizer(
        &self,
        store_id: &StoreId,
        expected_version: i64,
        present: bool,
    ) -> Result<i64> {
        let record = {
            let mut records = self.records.lock().await;
            let record = records
                .get_mut(store_id)
                .ok_or_else(|| RegistryError::NotFound(store_id.clone()))?;
            if record.resource_version != expected_version {
                return Err(RegistryError::Conflict {
                    store_id: store_id.clone(),
                    expected: expected_version,
                });
            }
            record.finalizer_present = present;
            record.resource_version += 1;
            record.clone()
        };
        self.notify(&record);
        Ok(record.resource_version)
    }

    async fn request_delete(&self, store_id: &StoreId) -> Result<DeleteIntent> {
        let (intent, change) = {
            let mut records = self.records.lock().await;
            let Some(record) = records.get_mut(store_id) else {
                return Ok(DeleteIntent::NotFound);
            };
            if !record.finalizer_present {
                records.remove(store_id);
                (
                    DeleteIntent::Removed,
                    StoreChange {
                        store_id: store_id.clone(),
                        deletion_requested: true,
                    },
                )
            } else {
                if record.deletion_requested_at.is_none() {
                    record.deletion_requested_at = Some(Utc::now());
                    record.resource_version += 1;
                }
                (
                    DeleteIntent::Pending,
                    StoreChange {
                        store_id: store_id.clone(),
                        deletion_requested: true,
                    },
                )
            }
        };
        let _ = self.changes.send(change);
        Ok(intent)
    }

    async fn request_retry(&self, store_id: &StoreId) -> Result<()> {
        let record = {
            let mut records = self.records.lock().await;
            let record = records
                .get_mut(store_id)
                .ok_or_else(|| RegistryError::NotFound(store_id.clone()))?;
            record.retry_generation += 1;
            record.generation += 1;
            record.resource_version += 1;
            record.clone()
        };
        self.notify(&record);
        Ok(())
    }

    async fn remove(&self, store_id: &StoreId) -> Result<()> {
        {
            let mut records = self.records.lock().await;
            let Some(record) = records.get(store_id) else {
                return Ok(());
            };
            if record.finalizer_present || !record.is_deleting() {
                return Err(RegistryError::RemovalBlocked(store_id.clone()));
            }
            records.remove(store_id);
        }
        let _ = self.changes.send(StoreChange {
            store_id: store_id.clone(),
            deletion_requested: true,
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}
