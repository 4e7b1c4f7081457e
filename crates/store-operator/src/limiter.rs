// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Admission gate and provisioning deadline.
//!
//! [`ProvisionLimiter`] bounds how many stores run heavy provisioning steps
//! at once. A store takes a slot when it starts heavy work and keeps it
//! across passes until it leaves `Provisioning`; stores beyond the bound
//! wait without touching the cluster.
//!
//! [`ProvisionDeadline`] is derived from the stored entry timestamp on every
//! pass, so a restarted controller sees the same elapsed time.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ReconcileError;
use crate::store::{StoreId, Step};

/// Bounded counting admission gate keyed by store.
pub struct ProvisionLimiter {
    semaphore: Arc<Semaphore>,
    held: Mutex<HashMap<StoreId, OwnedSemaphorePermit>>,
    capacity: usize,
    freed: Notify,
}

impl ProvisionLimiter {
    /// Create a gate with `capacity` slots (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            held: Mutex::new(HashMap::new()),
            capacity,
            freed: Notify::new(),
        }
    }

    /// Take a slot for `store_id` without waiting.
    ///
    /// Returns `true` if the store holds a slot afterwards. Calling again
    /// while holding a slot is a no-op that returns `true`.
    pub async fn try_acquire(&self, store_id: &StoreId) -> bool {
        let mut held = self.held.lock().await;
        if held.contains_key(store_id) {
            return true;
        }
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                held.insert(store_id.clone(), permit);
                debug!(store_id = %store_id, in_flight = held.len(), "Provisioning slot acquired");
                true
            }
            Err(_) => false,
        }
    }

    /// Return the store's slot, if it holds one.
    pub async fn release(&self, store_id: &StoreId) -> bool {
        let removed = self.held.lock().await.remove(store_id);
        match removed {
            Some(permit) => {
                drop(permit);
                debug!(store_id = %store_id, "Provisioning slot released");
                self.freed.notify_waiters();
                true
            }
            None => false,
        }
    }

    /// Whether the store currently holds a slot.
    pub async fn holds(&self, store_id: &StoreId) -> bool {
        self.held.lock().await.contains_key(store_id)
    }

    /// Number of slots in use.
    pub async fn in_flight(&self) -> usize {
        self.held.lock().await.len()
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Resolves the next time any slot is released.
    pub async fn slot_freed(&self) {
        self.freed.notified().await;
    }
}

/// Wall-clock deadline of one provisioning attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionDeadline {
    started_at: DateTime<Utc>,
    limit: Duration,
}

impl ProvisionDeadline {
    /// Deadline `limit` after `started_at`.
    pub fn new(started_at: DateTime<Utc>, limit: Duration) -> Self {
        Self { started_at, limit }
    }

    /// Time since the attempt started (zero if the clock went backwards).
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        (now - self.started_at).to_std().unwrap_or_default()
    }

    /// Time left, `None` once the deadline has passed.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.limit
            .checked_sub(self.elapsed(now))
            .filter(|d| !d.is_zero())
    }

    /// Whether the deadline has passed.
    pub fn is_exceeded(&self, now: DateTime<Utc>) -> bool {
        self.remaining(now).is_none()
    }

    /// Timeout error attributed to `step`.
    pub fn exceeded(&self, step: Step) -> ReconcileError {
        ReconcileError::ProvisionTimeout {
            elapsed_secs: self.elapsed(Utc::now()).as_secs(),
            limit_secs: self.limit.as_secs(),
            step,
        }
    }

    /// Run a heavy step, abandoning it on deadline or cancellation.
    ///
    /// The step future is dropped when either fires; callers re-derive state
    /// on the next pass instead of trusting a late result.
    pub async fn guard<T, F>(
        &self,
        cancel: &CancellationToken,
        step: Step,
        fut: F,
    ) -> Result<T, ReconcileError>
    where
        F: Future<Output = Result<T, ReconcileError>>,
    {
        let remaining = self
            .remaining(Utc::now())
            .ok_or_else(|| self.exceeded(step))?;

        tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(ReconcileError::Cancelled),

            result = tokio::time::timeout(remaining, fut) => match result {
                Ok(inner) => inner,
                Err(_) => Err(self.exceeded(step)),
            },
        }
    }
}
