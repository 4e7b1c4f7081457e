// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status and event recorder.
//!
//! All status writes are read-modify-write against the registry's current
//! resource version. A conflict re-reads the record and re-applies the
//! mutation, so a concurrent writer is never overwritten.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::registry::{RegistryError, StoreRegistry};
use crate::store::{Outcome, Phase, Step, StoreEvent, StoreId, StoreRecord, StoreStatus};

/// Conflict retries before a write gives up.
pub const MAX_CONFLICT_RETRIES: u32 = 5;

/// Mutable view of a status during an update.
pub struct StatusEdit<'a> {
    status: &'a mut StoreStatus,
    max_events: usize,
}

impl StatusEdit<'_> {
    /// Append an event, evicting the oldest beyond capacity.
    pub fn event(&mut self, step: Step, outcome: Outcome, message: impl Into<String>) {
        self.status
            .events
            .push_bounded(StoreEvent::now(step, outcome, message), self.max_events);
    }

    /// Move to `next` if the phase machine allows it; returns whether it moved.
    pub fn set_phase(&mut self, next: Phase) -> bool {
        if !self.status.phase.can_transition_to(next) {
            return false;
        }
        self.status.phase = next;
        true
    }
}

impl Deref for StatusEdit<'_> {
    type Target = StoreStatus;

    fn deref(&self) -> &StoreStatus {
        self.status
    }
}

impl DerefMut for StatusEdit<'_> {
    fn deref_mut(&mut self) -> &mut StoreStatus {
        self.status
    }
}

/// Writes status, events and the finalizer with conflict retry.
#[derive(Clone)]
pub struct StatusRecorder {
    registry: Arc<dyn StoreRegistry>,
    max_events: usize,
}

impl StatusRecorder {
    /// Create a recorder keeping at most `max_events` events per store.
    pub fn new(registry: Arc<dyn StoreRegistry>, max_events: usize) -> Self {
        Self {
            registry,
            max_events: max_events.max(1),
        }
    }

    /// Apply `mutate` to the store's current status and write it back.
    ///
    /// `mutate` sees the freshly read record and returns `false` to skip the
    /// write. It may run more than once when writes conflict. A record with
    /// no status yet starts from [`StoreStatus::provisioning`]. A mutation that
    /// moves the phase along an edge [`Phase::can_transition_to`] rejects is
    /// not written. Returns the record as written, or `None` if it no longer
    /// exists.
    pub async fn update<F>(
        &self,
        store_id: &StoreId,
        mut mutate: F,
    ) -> Result<Option<StoreRecord>, RegistryError>
    where
        F: FnMut(&StoreRecord, &mut StatusEdit<'_>) -> bool + Send,
    {
        let mut attempt = 0;
        loop {
            let Some(mut record) = self.registry.get(store_id).await? else {
                return Ok(None);
            };

            let now = Utc::now();
            let mut status = record
                .status
                .clone()
                .unwrap_or_else(|| StoreStatus::provisioning(now));
            let before = status.phase;
            let changed = {
                let mut edit = StatusEdit {
                    status: &mut status,
                    max_events: self.max_events,
                };
                mutate(&record, &mut edit)
            };
            if !changed {
                return Ok(Some(record));
            }
            if status.phase != before && !before.can_transition_to(status.phase) {
                warn!(store_id = %store_id, from = %before, to = %status.phase, "Refusing phase transition");
                return Ok(Some(record));
            }
            status.updated_at = now;

            match self
                .registry
                .update_status(store_id, record.resource_version, &status)
                .await
            {
                Ok(version) => {
                    debug!(store_id = %store_id, phase = %status.phase, version, "Status written");
                    record.status = Some(status);
                    record.resource_version = version;
                    return Ok(Some(record));
                }
                Err(e) if e.is_conflict() && attempt < MAX_CONFLICT_RETRIES => {
                    attempt += 1;
                    warn!(store_id = %store_id, attempt, "Status write conflict, re-reading");
                }
                Err(RegistryError::NotFound(_)) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    /// Append a single event without touching anything else.
    pub async fn event(
        &self,
        store_id: &StoreId,
        step: Step,
        outcome: Outcome,
        message: impl Into<String>,
    ) -> Result<Option<StoreRecord>, RegistryError> {
        let message = message.into();
        self.update(store_id, |_, status| {
            status.event(step, outcome, message.clone());
            true
        })
        .await
    }

    /// Set or clear the finalizer, retrying on conflict.
    ///
    /// A no-op when the finalizer is already in the requested state.
    pub async fn set_finalizer(
        &self,
        store_id: &StoreId,
        present: bool,
    ) -> Result<Option<StoreRecord>, RegistryError> {
        let mut attempt = 0;
        loop {
            let Some(mut record) = self.registry.get(store_id).await? else {
                return Ok(None);
            };
            if record.finalizer_present == present {
                return Ok(Some(record));
            }
            match self
                .registry
                .set_finalizer(store_id, record.resource_version, present)
                .await
            {
                Ok(version) => {
                    debug!(store_id = %store_id, present, "Finalizer updated");
                    record.finalizer_present = present;
                    record.resource_version = version;
                    return Ok(Some(record));
                }
                Err(e) if e.is_conflict() && attempt < MAX_CONFLICT_RETRIES => {
                    attempt += 1;
                    warn!(store_id = %store_id, attempt, "Finalizer write conflict, re-reading");
                }
                Err(RegistryError::NotFound(_)) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryRegistry;
    use crate::store::StoreSpec;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn setup(max_events: usize) -> (Arc<InMemoryRegistry>, StatusRecorder, StoreId) {
        let registry = Arc::new(InMemoryRegistry::new());
        let id = StoreId::parse("demo1").unwrap();
        registry
            .create(&StoreSpec::new(id.clone(), "woocommerce"))
            .await
            .unwrap();
        let recorder = StatusRecorder::new(registry.clone(), max_events);
        (registry, recorder, id)
    }

    #[tokio::test]
    async fn test_first_update_initializes_status() {
        let (_registry, recorder, id) = setup(20).await;
        let record = recorder
            .update(&id, |_, status| {
                status.event(Step::Accepted, Outcome::Started, "accepted");
                true
            })
            .await
            .unwrap()
            .unwrap();
        let status = record.status.unwrap();
        assert_eq!(status.phase, Phase::Provisioning);
        assert_eq!(status.events.len(), 1);
        assert_eq!(record.resource_version, 2);
    }

    #[tokio::test]
    async fn test_skipped_mutation_does_not_write() {
        let (registry, recorder, id) = setup(20).await;
        recorder.update(&id, |_, _| false).await.unwrap();
        assert_eq!(registry.status_writes(), 0);
    }

    #[tokio::test]
    async fn test_events_stay_bounded() {
        let (_registry, recorder, id) = setup(3).await;
        for i in 0..7 {
            recorder
                .event(&id, Step::Release, Outcome::Retrying, format!("try {i}"))
                .await
                .unwrap();
        }
        let record = recorder.update(&id, |_, _| false).await.unwrap().unwrap();
        let events = record.status.unwrap().events;
        assert_eq!(events.len(), 3);
        assert_eq!(events.last().unwrap().message, "try 6");
    }

    #[tokio::test]
    async fn test_conflict_rereads_and_reapplies() {
        let (registry, recorder, id) = setup(20).await;
        let calls = AtomicU32::new(0);

        let record = recorder
            .update(&id, |record, status| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    // A concurrent writer lands between our read and write.
                    let registry = registry.clone();
                    let id = record.store_id().clone();
                    let version = record.resource_version;
                    std::thread::spawn(move || {
                        tokio::runtime::Builder::new_current_thread()
                            .build()
                            .unwrap()
                            .block_on(async {
                                let mut other = StoreStatus::provisioning(Utc::now());
                                other.url = Some("http://other".to_string());
                                registry.update_status(&id, version, &other).await.unwrap();
                            })
                    })
                    .join()
                    .unwrap();
                }
                status.attempt += 1;
                true
            })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let status = record.status.unwrap();
        assert_eq!(status.url.as_deref(), Some("http://other"));
        assert_eq!(status.attempt, 2);
    }

    #[tokio::test]
    async fn test_phase_moves_only_along_allowed_edges() {
        let (registry, recorder, id) = setup(20).await;
        let ready = recorder
            .update(&id, |_, status| status.set_phase(Phase::Ready))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ready.phase(), Some(Phase::Ready));

        // Ready never goes back to provisioning or to failed.
        assert!(
            recorder
                .update(&id, |_, status| status.set_phase(Phase::Provisioning))
                .await
                .unwrap()
                .is_some()
        );
        let writes = registry.status_writes();
        let record = recorder
            .update(&id, |_, status| {
                status.phase = Phase::Failed;
                true
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.phase(), Some(Phase::Ready));
        assert_eq!(registry.status_writes(), writes);
        assert_eq!(registry.get(&id).await.unwrap().unwrap().phase(), Some(Phase::Ready));
    }

    #[tokio::test]
    async fn test_finalizer_toggle_is_idempotent() {
        let (_registry, recorder, id) = setup(20).await;
        let first = recorder.set_finalizer(&id, true).await.unwrap().unwrap();
        let second = recorder.set_finalizer(&id, true).await.unwrap().unwrap();
        assert!(second.finalizer_present);
        assert_eq!(first.resource_version, second.resource_version);
    }

    #[tokio::test]
    async fn test_update_of_missing_record_is_none() {
        let (_registry, recorder, _id) = setup(20).await;
        let ghost = StoreId::parse("ghost").unwrap();
        assert!(recorder.update(&ghost, |_, _| true).await.unwrap().is_none());
    }
}
