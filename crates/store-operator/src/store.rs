// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Store records: desired state, observed status and the event timeline.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Minimum length of a store identifier.
pub const STORE_ID_MIN_LEN: usize = 3;
/// Maximum length of a store identifier.
pub const STORE_ID_MAX_LEN: usize = 32;

/// Immutable, label-safe store identifier.
///
/// 3 to 32 characters of `[a-z0-9-]`, starting and ending with an
/// alphanumeric character so it is usable inside DNS labels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct StoreId(String);

impl StoreId {
    /// Validate and wrap a raw identifier.
    pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidStoreId> {
        let raw = raw.into();
        let len = raw.len();
        if !(STORE_ID_MIN_LEN..=STORE_ID_MAX_LEN).contains(&len) {
            return Err(InvalidStoreId {
                value: raw,
                reason: "must be 3 to 32 characters long",
            });
        }
        if !raw
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        {
            return Err(InvalidStoreId {
                value: raw,
                reason: "may only contain lowercase letters, digits and '-'",
            });
        }
        if raw.starts_with('-') || raw.ends_with('-') {
            return Err(InvalidStoreId {
                value: raw,
                reason: "must start and end with a letter or digit",
            });
        }
        Ok(Self(raw))
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for StoreId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        StoreId::parse(raw).map_err(serde::de::Error::custom)
    }
}

/// Rejected store identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid store id '{value}': {reason}")]
pub struct InvalidStoreId {
    /// The rejected value.
    pub value: String,
    /// Why it was rejected.
    pub reason: &'static str,
}

/// Lifecycle phase of a store.
///
/// ```text
///   (created) ──► Provisioning ──► Ready
///                   │    ▲           │
///                   ▼    │ retry     │ delete
///                  Failed ───────────┤
///                                    ▼
///                                 Deleting ──► Deleted (record removed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Provisioning steps are pending or running.
    Provisioning,
    /// Workload installed, healthy and reachable.
    Ready,
    /// The last provisioning attempt failed.
    Failed,
    /// Cleanup is running.
    Deleting,
    /// Cleanup finished; the record is about to be removed.
    Deleted,
}

impl Phase {
    /// Phase name as stored and exposed.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Provisioning => "Provisioning",
            Phase::Ready => "Ready",
            Phase::Failed => "Failed",
            Phase::Deleting => "Deleting",
            Phase::Deleted => "Deleted",
        }
    }

    /// Whether moving from `self` to `next` is an allowed transition.
    ///
    /// Transitions only move forward, except for the `Failed → Provisioning`
    /// retry edge. Any live phase may move to `Deleting`.
    pub fn can_transition_to(&self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Provisioning, Ready)
                | (Provisioning, Failed)
                | (Failed, Provisioning)
                | (Provisioning, Deleting)
                | (Ready, Deleting)
                | (Failed, Deleting)
                | (Deleting, Deleted)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provisioning or cleanup step that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Step {
    /// Record accepted and a provisioning attempt started.
    Accepted,
    /// Waiting for or holding a provisioning slot.
    Admission,
    /// Engine preflight check.
    Engine,
    /// Store namespace.
    Namespace,
    /// Namespace resource quota.
    ResourceQuota,
    /// Namespace limit range.
    LimitRange,
    /// Namespace network policies.
    NetworkPolicy,
    /// Admin credential secret.
    AdminSecret,
    /// Workload release install or upgrade.
    Release,
    /// Engine health check.
    HealthCheck,
    /// Store became reachable.
    Ready,
    /// Provisioning deadline check.
    Deadline,
    /// Retry of a failed attempt.
    Retry,
    /// Deletion observed.
    Deletion,
    /// Release uninstall during cleanup.
    Uninstall,
    /// Namespace deletion during cleanup.
    NamespaceDelete,
    /// Finalizer removal.
    Finalizer,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Accepted => "accepted",
            Step::Admission => "admission",
            Step::Engine => "engine",
            Step::Namespace => "namespace",
            Step::ResourceQuota => "resource-quota",
            Step::LimitRange => "limit-range",
            Step::NetworkPolicy => "network-policy",
            Step::AdminSecret => "admin-secret",
            Step::Release => "release",
            Step::HealthCheck => "health-check",
            Step::Ready => "ready",
            Step::Deadline => "deadline",
            Step::Retry => "retry",
            Step::Deletion => "deletion",
            Step::Uninstall => "uninstall",
            Step::NamespaceDelete => "namespace-delete",
            Step::Finalizer => "finalizer",
        };
        f.write_str(name)
    }
}

/// Outcome recorded for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Step started.
    Started,
    /// Step created a new object.
    Created,
    /// Step completed.
    Succeeded,
    /// Step is blocked and will be re-evaluated.
    Waiting,
    /// Step failed with a retryable error.
    Retrying,
    /// Step failed terminally.
    Failed,
}

/// A single timeline entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEvent {
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// Step that produced the event.
    pub step: Step,
    /// Outcome of the step.
    pub outcome: Outcome,
    /// Human-readable detail.
    pub message: String,
}

impl StoreEvent {
    /// Build an event stamped with the current time.
    pub fn now(step: Step, outcome: Outcome, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            step,
            outcome,
            message: message.into(),
        }
    }
}

/// Ordered, bounded event timeline.
///
/// Appending beyond the capacity evicts the oldest entries first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventLog(VecDeque<StoreEvent>);

impl EventLog {
    /// Append an event, evicting from the front so at most `capacity` remain.
    pub fn push_bounded(&mut self, event: StoreEvent, capacity: usize) {
        self.0.push_back(event);
        while self.0.len() > capacity.max(1) {
            self.0.pop_front();
        }
    }

    /// Most recent event.
    pub fn last(&self) -> Option<&StoreEvent> {
        self.0.back()
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the timeline is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &StoreEvent> {
        self.0.iter()
    }
}

/// Classification of the last terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The engine is not supported.
    UnsupportedEngine,
    /// Release install or upgrade failed.
    ReleaseInstall,
    /// The provisioning deadline passed.
    ProvisionTimeout,
    /// The namespace belongs to something else.
    NamespaceOwnership,
    /// The stored admin credential is unusable.
    InvalidCredential,
}

/// Desired configuration of a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSpec {
    /// Store identifier.
    pub store_id: StoreId,
    /// Engine name, resolved through the engine registry.
    pub engine: String,
    /// Engine-specific options.
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl StoreSpec {
    /// Spec with no engine options.
    pub fn new(store_id: StoreId, engine: impl Into<String>) -> Self {
        Self {
            store_id,
            engine: engine.into(),
            options: serde_json::Map::new(),
        }
    }
}

/// Observed state written by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStatus {
    /// Current lifecycle phase.
    pub phase: Phase,
    /// Public URL once derivable.
    #[serde(default)]
    pub url: Option<String>,
    /// Last error message, cleared on success or retry.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Classification of the last terminal failure.
    #[serde(default)]
    pub failure_kind: Option<FailureKind>,
    /// When the controller first observed the store.
    pub created_at: DateTime<Utc>,
    /// Last status write.
    pub updated_at: DateTime<Utc>,
    /// Entry time of the current provisioning attempt (deadline base).
    #[serde(default)]
    pub provisioning_started_at: Option<DateTime<Utc>>,
    /// When the store became ready.
    #[serde(default)]
    pub ready_at: Option<DateTime<Utc>>,
    /// When the store last failed.
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
    /// Namespace holding the store's objects.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Release installed by the current attempt; cleared on retry.
    #[serde(default)]
    pub release_name: Option<String>,
    /// Provisioning attempt number, starting at 1.
    #[serde(default)]
    pub attempt: u32,
    /// Last retry signal the controller acted upon.
    #[serde(default)]
    pub observed_retry_generation: i64,
    /// Bounded step-level timeline.
    #[serde(default)]
    pub events: EventLog,
}

impl StoreStatus {
    /// Initial status for a store entering its first provisioning attempt.
    pub fn provisioning(now: DateTime<Utc>) -> Self {
        Self {
            phase: Phase::Provisioning,
            url: None,
            last_error: None,
            failure_kind: None,
            created_at: now,
            updated_at: now,
            provisioning_started_at: Some(now),
            ready_at: None,
            failed_at: None,
            namespace: None,
            release_name: None,
            attempt: 1,
            observed_retry_generation: 0,
            events: EventLog::default(),
        }
    }
}

/// Desired plus observed state for one store, as held by the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreRecord {
    /// Desired state.
    pub spec: StoreSpec,
    /// Observed state; `None` until the controller first acts on the record.
    pub status: Option<StoreStatus>,
    /// Blocks record removal until cleanup is verified complete.
    pub finalizer_present: bool,
    /// When deletion was requested, if it was.
    pub deletion_requested_at: Option<DateTime<Utc>>,
    /// Incremented by every explicit retry request.
    pub retry_generation: i64,
    /// Incremented by every desired-state change.
    pub generation: i64,
    /// Incremented by every write; used for conditional updates.
    pub resource_version: i64,
    /// When the record was created in the registry.
    pub created_at: DateTime<Utc>,
}

impl StoreRecord {
    /// Store identifier.
    pub fn store_id(&self) -> &StoreId {
        &self.spec.store_id
    }

    /// Current phase, `None` before the controller has written status.
    pub fn phase(&self) -> Option<Phase> {
        self.status.as_ref().map(|s| s.phase)
    }

    /// Whether deletion has been requested.
    pub fn is_deleting(&self) -> bool {
        self.deletion_requested_at.is_some()
    }

    /// Read-only projection for the API and dashboard.
    pub fn view(&self) -> StoreView {
        let status = self.status.as_ref();
        StoreView {
            store_id: self.spec.store_id.clone(),
            engine: self.spec.engine.clone(),
            phase: status.map(|s| s.phase).unwrap_or(Phase::Provisioning),
            url: status.and_then(|s| s.url.clone()),
            last_error: status.and_then(|s| s.last_error.clone()),
            created_at: status.map(|s| s.created_at).unwrap_or(self.created_at),
            events: status
                .map(|s| s.events.iter().cloned().collect())
                .unwrap_or_default(),
        }
    }
}

/// Read model exposed to the API service and dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreView {
    /// Store identifier.
    pub store_id: StoreId,
    /// Engine name.
    pub engine: String,
    /// Current phase (`Provisioning` before the first status write).
    pub phase: Phase,
    /// Public URL, once ready.
    pub url: Option<String>,
    /// Last error message.
    pub last_error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Event timeline, oldest first.
    pub events: Vec<StoreEvent>,
}
