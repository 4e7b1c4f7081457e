// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Finalizer-gated teardown.
//!
//! Teardown runs in a fixed order and re-derives cluster state on every
//! pass, so a crash between steps resumes at the first unfinished one:
//!
//! 1. uninstall the release (absent is fine)
//! 2. delete the namespace if this store owns it (absent is fine; a
//!    terminating namespace keeps cleanup pending)
//! 3. mark the store `Deleted` and clear the finalizer
//!
//! The finalizer is only cleared once both resources are verified gone.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterClient, DeleteOutcome, ObjectKey};
use crate::engine::EngineRegistry;
use crate::error::ReconcileError;
use crate::guardrails::{NamespaceProvisioner, is_owned_by};
use crate::release::UninstallOutcome;
use crate::status::StatusRecorder;
use crate::store::{Outcome, Phase, Step, StoreRecord};

/// Progress of a cleanup pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupProgress {
    /// Resources are gone and the finalizer is cleared.
    Complete,
    /// The namespace is still terminating; check again later.
    NamespaceTerminating,
}

/// Runs the ordered teardown for deleted stores.
#[derive(Clone)]
pub struct CleanupManager {
    engines: EngineRegistry,
    cluster: Arc<dyn ClusterClient>,
    provisioner: NamespaceProvisioner,
    recorder: StatusRecorder,
}

impl CleanupManager {
    /// Create a cleanup manager.
    pub fn new(
        engines: EngineRegistry,
        cluster: Arc<dyn ClusterClient>,
        provisioner: NamespaceProvisioner,
        recorder: StatusRecorder,
    ) -> Self {
        Self {
            engines,
            cluster,
            provisioner,
            recorder,
        }
    }

    /// Run the remaining teardown steps for a store.
    pub async fn run(&self, record: &StoreRecord) -> Result<CleanupProgress, ReconcileError> {
        let store_id = record.store_id();
        let namespace = self.provisioner.namespace_for(store_id);

        // 1. release
        match self.engines.get(&record.spec.engine) {
            Some(handler) => {
                let outcome = handler
                    .uninstall(store_id, &namespace)
                    .await
                    .map_err(|e| ReconcileError::Cleanup {
                        step: Step::Uninstall,
                        message: e.to_string(),
                    })?;
                if outcome == UninstallOutcome::Uninstalled {
                    info!(store_id = %store_id, "Release uninstalled");
                    self.record(record, Step::Uninstall, Outcome::Succeeded, "release uninstalled")
                        .await?;
                }
            }
            None => {
                debug!(store_id = %store_id, engine = %record.spec.engine, "No handler, nothing to uninstall");
            }
        }

        // 2. namespace
        let key = ObjectKey::namespace(&namespace);
        let existing = self
            .cluster
            .get(&key)
            .await
            .map_err(|e| cleanup_error(Step::NamespaceDelete, e))?;

        match existing {
            None => {}
            Some(ns) if !is_owned_by(&ns, store_id) => {
                warn!(store_id = %store_id, namespace = %namespace, "Namespace not owned by store, leaving it in place");
            }
            Some(ns) if ns.terminating => {
                debug!(store_id = %store_id, namespace = %namespace, "Namespace still terminating");
                return Ok(CleanupProgress::NamespaceTerminating);
            }
            Some(_) => {
                let outcome = self
                    .cluster
                    .delete(&key)
                    .await
                    .map_err(|e| cleanup_error(Step::NamespaceDelete, e))?;
                if outcome == DeleteOutcome::Deleted {
                    info!(store_id = %store_id, namespace = %namespace, "Namespace deletion requested");
                    self.record(
                        record,
                        Step::NamespaceDelete,
                        Outcome::Started,
                        format!("namespace {namespace} deletion requested"),
                    )
                    .await?;
                }
                let still_there = self
                    .cluster
                    .get(&key)
                    .await
                    .map_err(|e| cleanup_error(Step::NamespaceDelete, e))?;
                if still_there.is_some() {
                    return Ok(CleanupProgress::NamespaceTerminating);
                }
            }
        }

        // 3. finalizer
        self.recorder
            .update(store_id, |_, status| {
                if !status.set_phase(Phase::Deleted) {
                    return false;
                }
                status.url = None;
                status.event(Step::Finalizer, Outcome::Succeeded, "resources removed");
                true
            })
            .await
            .map_err(|e| ReconcileError::registry(Step::Finalizer, e))?;

        self.recorder
            .set_finalizer(store_id, false)
            .await
            .map_err(|e| ReconcileError::registry(Step::Finalizer, e))?;

        info!(store_id = %store_id, elapsed_ms = elapsed_ms(record), "Cleanup complete");
        Ok(CleanupProgress::Complete)
    }

    async fn record(
        &self,
        record: &StoreRecord,
        step: Step,
        outcome: Outcome,
        message: impl Into<String>,
    ) -> Result<(), ReconcileError> {
        self.recorder
            .event(record.store_id(), step, outcome, message)
            .await
            .map(|_| ())
            .map_err(|e| ReconcileError::registry(step, e))
    }
}

fn cleanup_error(step: Step, err: crate::cluster::ClusterError) -> ReconcileError {
    ReconcileError::Cleanup {
        step,
        message: err.to_string(),
    }
}

fn elapsed_ms(record: &StoreRecord) -> i64 {
    record
        .deletion_requested_at
        .map(|at| (Utc::now() - at).num_milliseconds())
        .unwrap_or_default()
}
