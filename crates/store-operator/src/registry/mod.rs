// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Desired/observed-state registry for store records.
//!
//! The registry is the single source of truth. Every controller write is
//! conditional on the record's `resource_version`; a stale write fails with
//! [`RegistryError::Conflict`], distinct from any other failure, and the
//! caller re-reads instead of overwriting.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::store::{StoreId, StoreRecord, StoreSpec, StoreStatus, StoreView};

pub use memory::InMemoryRegistry;
pub use postgres::PostgresRegistry;

/// Capacity of the change broadcast channel.
pub const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Errors from registry operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// The record does not exist.
    #[error("Store not found: {0}")]
    NotFound(StoreId),

    /// A record with the same id already exists.
    #[error("Store already exists: {0}")]
    AlreadyExists(StoreId),

    /// The write was based on a stale resource version.
    #[error("Conflict writing store {store_id}: expected resource version {expected}")]
    Conflict {
        /// Store being written.
        store_id: StoreId,
        /// Resource version the writer observed.
        expected: i64,
    },

    /// Removal refused while the finalizer is present or no delete was requested.
    #[error("Store {0} cannot be removed yet: finalizer present or deletion not requested")]
    RemovalBlocked(StoreId),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Stored status could not be (de)serialized.
    #[error("Status serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row holds an invalid store id.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl RegistryError {
    /// Whether this is an optimistic-concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, RegistryError::Conflict { .. })
    }
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Change notification emitted on every write to a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    /// Store that changed.
    pub store_id: StoreId,
    /// Whether deletion has been requested for the store.
    pub deletion_requested: bool,
}

/// Outcome of a delete request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteIntent {
    /// No finalizer was present; the record was removed immediately.
    Removed,
    /// Deletion recorded; the controller will clean up and remove the record.
    Pending,
    /// No such record.
    NotFound,
}

/// Registry of store records.
///
/// `create`, `request_delete` and `request_retry` form the write surface of
/// the API service; the controller uses the conditional status and finalizer
/// writes plus `remove`.
#[async_trait]
pub trait StoreRegistry: Send + Sync {
    /// Fetch a record.
    async fn get(&self, store_id: &StoreId) -> Result<Option<StoreRecord>>;

    /// List all records, ordered by store id.
    async fn list(&self) -> Result<Vec<StoreRecord>>;

    /// Create a record from a desired spec.
    async fn create(&self, spec: &StoreSpec) -> Result<StoreRecord>;

    /// Conditionally replace the status; returns the new resource version.
    async fn update_status(
        &self,
        store_id: &StoreId,
        expected_version: i64,
        status: &StoreStatus,
    ) -> Result<i64>;

    /// Conditionally set or clear the finalizer; returns the new resource version.
    async fn set_finalizer(
        &self,
        store_id: &StoreId,
        expected_version: i64,
        present: bool,
    ) -> Result<i64>;

    /// Record delete intent, removing immediately if no finalizer is present.
    async fn request_delete(&self, store_id: &StoreId) -> Result<DeleteIntent>;

    /// Signal an explicit retry of a failed store.
    async fn request_retry(&self, store_id: &StoreId) -> Result<()>;

    /// Remove a record whose deletion was requested and whose finalizer is clear.
    ///
    /// Removing an absent record succeeds.
    async fn remove(&self, store_id: &StoreId) -> Result<()>;

    /// Subscribe to change notifications.
    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;

    /// Read model of one store, as served to the API and dashboard.
    async fn view(&self, store_id: &StoreId) -> Result<Option<StoreView>> {
        Ok(self.get(store_id).await?.as_ref().map(StoreRecord::view))
    }

    /// Read models of every store, ordered by store id.
    async fn list_views(&self) -> Result<Vec<StoreView>> {
        Ok(self.list().await?.iter().map(StoreRecord::view).collect())
    }
}
