// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Store lifecycle state machine.
//!
//! One call to [`Reconciler::reconcile`] is one level-triggered pass: it
//! re-reads the record, compares it with the cluster, applies the next
//! corrective steps and tells the dispatcher when to look again. Passes are
//! safe to repeat and safe to resume after a pass that stopped half way.
//!
//! ```text
//!                 ┌──────────────┐ deadline / terminal error ┌────────┐
//!  (created) ───► │ Provisioning │ ─────────────────────────►│ Failed │
//!                 └──────┬───────┘ ◄──────────────────────── └───┬────┘
//!                        │ healthy + url      retry signal /     │
//!                        ▼                    resume pass        │
//!                 ┌──────────────┐                               │
//!                 │    Ready     │                               │
//!                 └──────┬───────┘                               │
//!                        │ delete requested (any live phase)     │
//!                        ▼                                       │
//!                 ┌──────────────┐ ◄─────────────────────────────┘
//!                 │   Deleting   │
//!                 └──────┬───────┘
//!                        │ release + namespace gone, finalizer cleared
//!                        ▼
//!                     Deleted (record removed)
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cleanup::{CleanupManager, CleanupProgress};
use crate::config::RetryPolicy;
use crate::engine::{EngineError, EngineHandler, EngineRegistry, InstallContext};
use crate::error::ReconcileError;
use crate::guardrails::NamespaceProvisioner;
use crate::limiter::{ProvisionDeadline, ProvisionLimiter};
use crate::registry::{RegistryError, StoreRegistry};
use crate::status::StatusRecorder;
use crate::store::{FailureKind, Outcome, Phase, Step, StoreId, StoreRecord, StoreStatus};

/// What the dispatcher should do after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing to do until the record changes.
    Done,
    /// Run another pass after the delay.
    Requeue(Duration),
    /// Waiting for a provisioning slot; run again when one frees up, or
    /// after the delay at the latest.
    WaitForSlot(Duration),
}

/// Why a pass is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    /// Watch notification, requeue or resync.
    Normal,
    /// First pass after controller start.
    Resume,
}

/// Requeue delays.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    /// After a retryable error.
    pub transient: Duration,
    /// While the workload is installed but not yet healthy.
    pub health_poll: Duration,
    /// While a namespace is terminating during cleanup.
    pub terminating_poll: Duration,
    /// Upper bound on waiting for a provisioning slot.
    pub admission_poll: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            transient: Duration::from_secs(5),
            health_poll: Duration::from_secs(5),
            terminating_poll: Duration::from_secs(5),
            admission_poll: Duration::from_secs(10),
        }
    }
}

enum HeavyOutcome {
    Ready { url: String, revision: Option<u32> },
    NotHealthy,
}

/// Drives store records through their lifecycle.
#[derive(Clone)]
pub struct Reconciler {
    registry: Arc<dyn StoreRegistry>,
    recorder: StatusRecorder,
    provisioner: NamespaceProvisioner,
    engines: EngineRegistry,
    limiter: Arc<ProvisionLimiter>,
    cleanup: CleanupManager,
    max_provision: Duration,
    retry_policy: RetryPolicy,
    timings: Timings,
}

impl Reconciler {
    /// Create a reconciler.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<dyn StoreRegistry>,
        recorder: StatusRecorder,
        provisioner: NamespaceProvisioner,
        engines: EngineRegistry,
        limiter: Arc<ProvisionLimiter>,
        cleanup: CleanupManager,
        max_provision: Duration,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            recorder,
            provisioner,
            engines,
            limiter,
            cleanup,
            max_provision,
            retry_policy,
            timings: Timings::default(),
        }
    }

    /// Override requeue delays.
    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// The admission gate.
    pub fn limiter(&self) -> &Arc<ProvisionLimiter> {
        &self.limiter
    }

    /// The store registry.
    pub fn registry(&self) -> &Arc<dyn StoreRegistry> {
        &self.registry
    }

    /// Run one pass for a store.
    ///
    /// Retryable failures are recorded on the store and turned into a
    /// requeue; only registry failures that prevent recording anything
    /// surface as `Err`.
    pub async fn reconcile(
        &self,
        store_id: &StoreId,
        kind: PassKind,
        cancel: &CancellationToken,
    ) -> Result<Action, ReconcileError> {
        let Some(record) = self.read(store_id).await? else {
            // Removed, possibly by a delete without finalizer.
            self.limiter.release(store_id).await;
            debug!(store_id = %store_id, "Record gone, nothing to reconcile");
            return Ok(Action::Done);
        };

        if record.is_deleting() {
            return self.reconcile_delete(record).await;
        }

        let record = self.ensure_finalizer(record).await?;
        let record = match record.status {
            Some(_) => record,
            None => match self.accept(&record).await? {
                Some(record) => record,
                None => return Ok(Action::Done),
            },
        };

        match record.phase() {
            Some(Phase::Provisioning) => self.provision(record, cancel).await,
            Some(Phase::Failed) => self.maybe_retry(record, kind).await,
            Some(Phase::Ready) => {
                debug!(store_id = %store_id, "Store ready, nothing to do");
                Ok(Action::Done)
            }
            Some(Phase::Deleting) | Some(Phase::Deleted) | None => Ok(Action::Done),
        }
    }

    async fn read(&self, store_id: &StoreId) -> Result<Option<StoreRecord>, ReconcileError> {
        self.registry
            .get(store_id)
            .await
            .map_err(|e| ReconcileError::registry(Step::Accepted, e))
    }

    /// Add the finalizer before anything can be created for the store.
    async fn ensure_finalizer(&self, record: StoreRecord) -> Result<StoreRecord, ReconcileError> {
        if record.finalizer_present {
            return Ok(record);
        }
        let store_id = record.store_id().clone();
        match self.recorder.set_finalizer(&store_id, true).await {
            Ok(Some(updated)) => Ok(updated),
            Ok(None) => Ok(record),
            Err(e) => Err(ReconcileError::registry(Step::Finalizer, e)),
        }
    }

    /// First observation: stamp the attempt and enter `Provisioning`.
    async fn accept(&self, record: &StoreRecord) -> Result<Option<StoreRecord>, ReconcileError> {
        let namespace = self.provisioner.namespace_for(record.store_id());
        let updated = self
            .recorder
            .update(record.store_id(), |current, status| {
                if current.status.is_some() {
                    return false;
                }
                status.namespace = Some(namespace.clone());
                status.observed_retry_generation = current.retry_generation;
                status.event(
                    Step::Accepted,
                    Outcome::Started,
                    format!("provisioning {} store", current.spec.engine),
                );
                true
            })
            .await
            .map_err(|e| ReconcileError::registry(Step::Accepted, e))?;

        if updated.is_some() {
            info!(store_id = %record.store_id(), engine = %record.spec.engine, phase = "Provisioning", "Store accepted");
        }
        Ok(updated)
    }

    async fn provision(
        &self,
        record: StoreRecord,
        cancel: &CancellationToken,
    ) -> Result<Action, ReconcileError> {
        let store_id = record.store_id().clone();
        let Some(status) = record.status.as_ref() else {
            return Ok(Action::Done);
        };
        let started_at = status
            .provisioning_started_at
            .unwrap_or(status.updated_at);
        let deadline = ProvisionDeadline::new(started_at, self.max_provision);

        // Checked before anything else so a slow attempt cannot outlive it.
        if deadline.is_exceeded(Utc::now()) {
            return self.fail(&record, deadline.exceeded(last_step(status))).await;
        }

        let handler = match self.resolve_engine(&record) {
            Ok(handler) => handler,
            Err(e) => return self.fail(&record, e).await,
        };

        if !self.limiter.try_acquire(&store_id).await {
            self.note_waiting(&record).await?;
            let wait = deadline
                .remaining(Utc::now())
                .map_or(Duration::ZERO, |r| r.min(self.timings.admission_poll));
            return Ok(Action::WaitForSlot(wait));
        }
        self.note_admitted(&record).await?;

        match self.heavy_steps(&record, handler.as_ref(), &deadline, cancel).await {
            Ok(HeavyOutcome::Ready { url, revision }) => self.mark_ready(&record, url, revision).await,
            Ok(HeavyOutcome::NotHealthy) => {
                debug!(store_id = %store_id, "Workload not healthy yet");
                let wait = deadline
                    .remaining(Utc::now())
                    .map_or(Duration::ZERO, |r| r.min(self.timings.health_poll));
                Ok(Action::Requeue(wait))
            }
            Err(ReconcileError::Cancelled) => {
                info!(store_id = %store_id, "Provisioning interrupted by deletion");
                Ok(Action::Requeue(Duration::ZERO))
            }
            Err(e) if e.is_terminal() => self.fail(&record, e).await,
            Err(e) => {
                warn!(store_id = %store_id, step = %e.step(), error = %e, "Provisioning step failed, will retry");
                self.note_retry(&record, &e).await?;
                let wait = deadline
                    .remaining(Utc::now())
                    .map_or(Duration::ZERO, |r| r.min(self.timings.transient));
                Ok(Action::Requeue(wait))
            }
        }
    }

    fn resolve_engine(&self, record: &StoreRecord) -> Result<Arc<dyn EngineHandler>, ReconcileError> {
        let engine = &record.spec.engine;
        let handler = self.engines.get(engine).ok_or_else(|| {
            ReconcileError::UnsupportedEngine(format!(
                "engine '{engine}' is not registered (known: {})",
                self.engines.names().join(", ")
            ))
        })?;
        handler
            .preflight(&record.spec)
            .map_err(|e| ReconcileError::UnsupportedEngine(e.to_string()))?;
        Ok(handler)
    }

    /// Namespace, guardrails, secret, release, health and URL, each bounded
    /// by the deadline and abandoned on cancellation.
    async fn heavy_steps(
        &self,
        record: &StoreRecord,
        handler: &dyn EngineHandler,
        deadline: &ProvisionDeadline,
        cancel: &CancellationToken,
    ) -> Result<HeavyOutcome, ReconcileError> {
        let store_id = record.store_id();

        let report = deadline
            .guard(cancel, Step::Namespace, self.provisioner.ensure(store_id))
            .await?;
        if !report.created.is_empty() {
            let created = report.created.clone();
            self.recorder
                .update(store_id, |_, status| {
                    for (step, key) in &created {
                        status.event(*step, Outcome::Created, format!("created {key}"));
                    }
                    true
                })
                .await
                .map_err(|e| ReconcileError::registry(Step::Namespace, e))?;
        }

        let namespace = report.namespace.as_str();
        let check_health = move || async move {
            handler
                .health_check(store_id, namespace)
                .await
                .map_err(|e| ReconcileError::TransientInfra {
                    step: Step::HealthCheck,
                    message: e.to_string(),
                })
        };

        // Set once an install returns for this attempt; later passes only poll health.
        let installed = record
            .status
            .as_ref()
            .is_some_and(|s| s.release_name.is_some());

        let mut revision = None;
        if !deadline.guard(cancel, Step::HealthCheck, check_health()).await? {
            if installed {
                return Ok(HeavyOutcome::NotHealthy);
            }
            let handle = deadline
                .guard(cancel, Step::Release, async {
                    handler
                        .install_or_upgrade(InstallContext {
                            spec: &record.spec,
                            namespace: &report.namespace,
                            credential: &report.credential,
                        })
                        .await
                        .map_err(install_error)
                })
                .await?;
            revision = handle.revision;
            let release = handle.name.clone();
            self.recorder
                .update(store_id, |_, status| {
                    status.release_name = Some(release.clone());
                    status.event(
                        Step::Release,
                        Outcome::Succeeded,
                        format!("release {release} installed (revision {})", revision.unwrap_or_default()),
                    );
                    true
                })
                .await
                .map_err(|e| ReconcileError::registry(Step::Release, e))?;

            if !deadline.guard(cancel, Step::HealthCheck, check_health()).await? {
                return Ok(HeavyOutcome::NotHealthy);
            }
        }

        let url = handler
            .derive_url(store_id)
            .ok_or_else(|| ReconcileError::TransientInfra {
                step: Step::Ready,
                message: "store URL is not derivable yet".to_string(),
            })?;
        Ok(HeavyOutcome::Ready { url, revision })
    }

    async fn mark_ready(
        &self,
        record: &StoreRecord,
        url: String,
        revision: Option<u32>,
    ) -> Result<Action, ReconcileError> {
        let store_id = record.store_id();
        let release = self
            .engines
            .get(&record.spec.engine)
            .map(|h| h.release_name(store_id));
        let now = Utc::now();
        let written = self
            .recorder
            .update(store_id, |current, status| {
                if current.is_deleting() || !status.set_phase(Phase::Ready) {
                    return false;
                }
                status.url = Some(url.clone());
                status.last_error = None;
                status.failure_kind = None;
                status.ready_at = Some(now);
                status.observed_retry_generation = current.retry_generation;
                if status.release_name.is_none() {
                    status.release_name = release.clone();
                }
                status.event(Step::Ready, Outcome::Succeeded, format!("store available at {url}"));
                true
            })
            .await
            .map_err(|e| ReconcileError::registry(Step::Ready, e))?;
        self.limiter.release(store_id).await;

        if let Some(record) = written
            && record.phase() == Some(Phase::Ready)
        {
            info!(store_id = %store_id, url = %url, revision = ?revision, phase = "Ready", "Store ready");
        }
        Ok(Action::Done)
    }

    async fn fail(&self, record: &StoreRecord, err: ReconcileError) -> Result<Action, ReconcileError> {
        let store_id = record.store_id();
        self.limiter.release(store_id).await;

        let message = err.to_string();
        let kind = err.failure_kind();
        let step = err.step();
        let now = Utc::now();
        self.recorder
            .update(store_id, |current, status| {
                if current.is_deleting() || !status.set_phase(Phase::Failed) {
                    return false;
                }
                status.last_error = Some(message.clone());
                status.failure_kind = kind;
                status.failed_at = Some(now);
                // Signals sent during the attempt are consumed by its outcome.
                status.observed_retry_generation = current.retry_generation;
                status.event(step, Outcome::Failed, message.clone());
                true
            })
            .await
            .map_err(|e| ReconcileError::registry(step, e))?;

        warn!(store_id = %store_id, step = %step, error = %message, phase = "Failed", "Provisioning failed");

        match self.retry_policy {
            RetryPolicy::Automatic { backoff, max_attempts }
                if kind != Some(FailureKind::UnsupportedEngine) =>
            {
                let attempt = record.status.as_ref().map_or(1, |s| s.attempt);
                if attempt < max_attempts {
                    return Ok(Action::Requeue(backoff_for(backoff, attempt)));
                }
                Ok(Action::Done)
            }
            _ => Ok(Action::Done),
        }
    }

    /// Decide whether a failed store re-enters provisioning.
    async fn maybe_retry(&self, record: StoreRecord, kind: PassKind) -> Result<Action, ReconcileError> {
        let store_id = record.store_id().clone();
        let Some(status) = record.status.as_ref() else {
            return Ok(Action::Done);
        };

        let explicit = record.retry_generation > status.observed_retry_generation;
        let retryable_kind = status.failure_kind != Some(FailureKind::UnsupportedEngine);
        let resume = kind == PassKind::Resume && self.retry_policy.retries_on_resume() && retryable_kind;

        let mut automatic = false;
        if let RetryPolicy::Automatic { backoff, max_attempts } = self.retry_policy
            && retryable_kind
            && status.attempt < max_attempts
        {
            let wait = backoff_for(backoff, status.attempt);
            let since = status
                .failed_at
                .map(|at| (Utc::now() - at).to_std().unwrap_or_default())
                .unwrap_or(wait);
            if since < wait && !explicit && !resume {
                return Ok(Action::Requeue(wait - since));
            }
            automatic = true;
        }

        if !(explicit || resume || automatic) {
            debug!(store_id = %store_id, "Failed store waits for a retry signal");
            return Ok(Action::Done);
        }

        let reason = if explicit {
            "retry requested"
        } else if resume {
            "retry on controller start"
        } else {
            "automatic retry"
        };
        let now = Utc::now();
        let written = self
            .recorder
            .update(&store_id, |current, status| {
                if current.is_deleting() || !status.set_phase(Phase::Provisioning) {
                    return false;
                }
                status.last_error = None;
                status.failure_kind = None;
                status.url = None;
                status.release_name = None;
                status.provisioning_started_at = Some(now);
                status.attempt += 1;
                status.observed_retry_generation = current.retry_generation;
                let attempt = status.attempt;
                status.event(Step::Retry, Outcome::Started, format!("{reason} (attempt {attempt})"));
                true
            })
            .await
            .map_err(|e| ReconcileError::registry(Step::Retry, e))?;

        info!(store_id = %store_id, reason, phase = "Provisioning", "Retrying failed store");
        Ok(match written {
            Some(_) => Action::Requeue(Duration::ZERO),
            None => Action::Done,
        })
    }

    async fn reconcile_delete(&self, record: StoreRecord) -> Result<Action, ReconcileError> {
        let store_id = record.store_id().clone();
        self.limiter.release(&store_id).await;

        if !record.finalizer_present {
            return self.remove(&store_id).await;
        }

        let Some(record) = self
            .recorder
            .update(&store_id, |_, status| {
                if !status.set_phase(Phase::Deleting) {
                    return false;
                }
                status.event(Step::Deletion, Outcome::Started, "deletion requested");
                true
            })
            .await
            .map_err(|e| ReconcileError::registry(Step::Deletion, e))?
        else {
            return Ok(Action::Done);
        };

        match self.cleanup.run(&record).await {
            Ok(CleanupProgress::Complete) => self.remove(&store_id).await,
            Ok(CleanupProgress::NamespaceTerminating) => {
                Ok(Action::Requeue(self.timings.terminating_poll))
            }
            Err(e) => {
                warn!(store_id = %store_id, step = %e.step(), error = %e, "Cleanup step failed, will retry");
                self.note_retry(&record, &e).await?;
                Ok(Action::Requeue(self.timings.transient))
            }
        }
    }

    async fn remove(&self, store_id: &StoreId) -> Result<Action, ReconcileError> {
        match self.registry.remove(store_id).await {
            Ok(()) => {
                info!(store_id = %store_id, phase = "Deleted", "Store removed");
                Ok(Action::Done)
            }
            Err(RegistryError::RemovalBlocked(_)) => Ok(Action::Requeue(self.timings.transient)),
            Err(e) => Err(ReconcileError::registry(Step::Finalizer, e)),
        }
    }

    async fn note_waiting(&self, record: &StoreRecord) -> Result<(), ReconcileError> {
        let capacity = self.limiter.capacity();
        self.recorder
            .update(record.store_id(), |_, status| {
                if last_is(status, Step::Admission, Outcome::Waiting) {
                    return false;
                }
                status.event(
                    Step::Admission,
                    Outcome::Waiting,
                    format!("waiting for a provisioning slot ({capacity} in use)"),
                );
                true
            })
            .await
            .map(|_| ())
            .map_err(|e| ReconcileError::registry(Step::Admission, e))
    }

    async fn note_admitted(&self, record: &StoreRecord) -> Result<(), ReconcileError> {
        self.recorder
            .update(record.store_id(), |_, status| {
                if !last_is(status, Step::Admission, Outcome::Waiting) {
                    return false;
                }
                status.event(Step::Admission, Outcome::Succeeded, "provisioning slot acquired");
                true
            })
            .await
            .map(|_| ())
            .map_err(|e| ReconcileError::registry(Step::Admission, e))
    }

    /// Record a retryable failure once per distinct message.
    async fn note_retry(&self, record: &StoreRecord, err: &ReconcileError) -> Result<(), ReconcileError> {
        let step = err.step();
        let message = err.to_string();
        self.recorder
            .update(record.store_id(), |_, status| {
                let repeated = status
                    .events
                    .last()
                    .is_some_and(|e| e.step == step && e.outcome == Outcome::Retrying && e.message == message);
                if repeated {
                    return false;
                }
                status.last_error = Some(message.clone());
                status.event(step, Outcome::Retrying, message.clone());
                true
            })
            .await
            .map(|_| ())
            .map_err(|e| ReconcileError::registry(step, e))
    }
}

fn install_error(err: EngineError) -> ReconcileError {
    match err {
        EngineError::Unsupported { .. } => ReconcileError::UnsupportedEngine(err.to_string()),
        other => ReconcileError::ReleaseInstall(other.to_string()),
    }
}

fn last_is(status: &StoreStatus, step: Step, outcome: Outcome) -> bool {
    status
        .events
        .last()
        .is_some_and(|e| e.step == step && e.outcome == outcome)
}

/// Step shown in a timeout message: the last one the timeline mentions.
fn last_step(status: &StoreStatus) -> Step {
    status.events.last().map_or(Step::Accepted, |e| e.step)
}

/// `base * 2^(attempt - 1)`, capped at one hour.
fn backoff_for(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
    base.saturating_mul(factor).min(Duration::from_secs(3600))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{InMemoryCluster, ObjectKey, ObjectKind};
    use crate::config::EngineSettings;
    use crate::registry::{DeleteIntent, InMemoryRegistry};
    use crate::release::{MockInstaller, ReleaseStatus};
    use crate::store::StoreSpec;

    struct Fixture {
        registry: Arc<InMemoryRegistry>,
        cluster: Arc<InMemoryCluster>,
        installer: Arc<MockInstaller>,
        reconciler: Reconciler,
    }

    fn fixture(installer: MockInstaller, capacity: usize, max_provision: Duration) -> Fixture {
        fixture_with_policy(installer, capacity, max_provision, RetryPolicy::Resume)
    }

    fn fixture_with_policy(
        installer: MockInstaller,
        capacity: usize,
        max_provision: Duration,
        retry_policy: RetryPolicy,
    ) -> Fixture {
        let registry = Arc::new(InMemoryRegistry::new());
        let cluster = Arc::new(InMemoryCluster::new());
        let installer = Arc::new(installer);
        let engines = EngineRegistry::with_defaults(EngineSettings::default(), installer.clone());
        let provisioner = NamespaceProvisioner::new(cluster.clone(), "store-", "store-admin");
        let recorder = StatusRecorder::new(registry.clone(), 50);
        let cleanup = CleanupManager::new(engines.clone(), cluster.clone(), provisioner.clone(), recorder.clone());
        let reconciler = Reconciler::new(
            registry.clone(),
            recorder,
            provisioner,
            engines,
            Arc::new(ProvisionLimiter::new(capacity)),
            cleanup,
            max_provision,
            retry_policy,
        );
        Fixture {
            registry,
            cluster,
            installer,
            reconciler,
        }
    }

    async fn create(f: &Fixture, raw: &str, engine: &str) -> StoreId {
        let id = StoreId::parse(raw).unwrap();
        f.registry.create(&StoreSpec::new(id.clone(), engine)).await.unwrap();
        id
    }

    async fn pass(f: &Fixture, id: &StoreId) -> Action {
        f.reconciler
            .reconcile(id, PassKind::Normal, &CancellationToken::new())
            .await
            .unwrap()
    }

    async fn status(f: &Fixture, id: &StoreId) -> StoreStatus {
        f.registry.get(id).await.unwrap().unwrap().status.unwrap()
    }

    #[tokio::test]
    async fn test_woocommerce_store_becomes_ready() {
        let f = fixture(MockInstaller::new().with_delay(0), 2, Duration::from_secs(60));
        let id = create(&f, "demo1", "woocommerce").await;

        assert_eq!(pass(&f, &id).await, Action::Done);

        let record = f.registry.get(&id).await.unwrap().unwrap();
        assert!(record.finalizer_present);
        let status = record.status.unwrap();
        assert_eq!(status.phase, Phase::Ready);
        assert_eq!(status.url.as_deref(), Some("http://demo1.127.0.0.1.nip.io"));
        assert_eq!(status.release_name.as_deref(), Some("woocommerce-demo1"));
        assert!(status.ready_at.is_some());
        assert!(f.cluster.contains(&ObjectKey::namespace("store-demo1")).await);
        assert_eq!(f.installer.release_count().await, 1);
        assert!(!f.reconciler.limiter().holds(&id).await);
    }

    #[tokio::test]
    async fn test_ready_store_pass_is_a_noop() {
        let f = fixture(MockInstaller::new().with_delay(0), 2, Duration::from_secs(60));
        let id = create(&f, "demo1", "woocommerce").await;
        pass(&f, &id).await;
        let writes = f.registry.status_writes();
        let creates = f.cluster.create_count();

        assert_eq!(pass(&f, &id).await, Action::Done);
        assert_eq!(f.registry.status_writes(), writes);
        assert_eq!(f.cluster.create_count(), creates);
        assert_eq!(f.installer.install_count(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_engine_fails_without_cluster_objects() {
        let f = fixture(MockInstaller::new().with_delay(0), 2, Duration::from_secs(60));
        let id = create(&f, "demo2", "medusa").await;

        assert_eq!(pass(&f, &id).await, Action::Done);

        let status = status(&f, &id).await;
        assert_eq!(status.phase, Phase::Failed);
        assert_eq!(status.failure_kind, Some(FailureKind::UnsupportedEngine));
        assert!(status.last_error.unwrap().contains("medusa"));
        assert!(f.cluster.namespaces().await.is_empty());
        assert_eq!(f.installer.install_count(), 0);
    }

    #[tokio::test]
    async fn test_store_waits_for_slot_and_records_it_once() {
        let f = fixture(MockInstaller::new().with_delay(0), 1, Duration::from_secs(60));
        let busy = StoreId::parse("busy").unwrap();
        assert!(f.reconciler.limiter().try_acquire(&busy).await);
        let id = create(&f, "demo1", "woocommerce").await;

        assert!(matches!(pass(&f, &id).await, Action::WaitForSlot(_)));
        assert!(matches!(pass(&f, &id).await, Action::WaitForSlot(_)));
        let waiting = status(&f, &id)
            .await
            .events
            .iter()
            .filter(|e| e.outcome == Outcome::Waiting)
            .count();
        assert_eq!(waiting, 1);
        assert!(f.cluster.namespaces().await.is_empty());

        f.reconciler.limiter().release(&busy).await;
        assert_eq!(pass(&f, &id).await, Action::Done);
        assert_eq!(status(&f, &id).await.phase, Phase::Ready);
    }

    #[tokio::test]
    async fn test_hung_install_times_out() {
        let f = fixture(MockInstaller::never_completing(), 1, Duration::from_millis(200));
        let id = create(&f, "slow", "woocommerce").await;

        assert_eq!(pass(&f, &id).await, Action::Done);

        let status = status(&f, &id).await;
        assert_eq!(status.phase, Phase::Failed);
        assert_eq!(status.failure_kind, Some(FailureKind::ProvisionTimeout));
        assert!(status.last_error.unwrap().contains("deadline exceeded"));
        assert!(!f.reconciler.limiter().holds(&id).await);
    }

    #[tokio::test]
    async fn test_failed_install_retries_on_explicit_signal() {
        let f = fixture(MockInstaller::new().with_delay(0), 1, Duration::from_secs(60));
        f.installer.fail_release("woocommerce-demo1").await;
        let id = create(&f, "demo1", "woocommerce").await;

        pass(&f, &id).await;
        let failed = status(&f, &id).await;
        assert_eq!(failed.phase, Phase::Failed);
        assert_eq!(failed.failure_kind, Some(FailureKind::ReleaseInstall));

        // Without a signal the failed store stays put.
        assert_eq!(pass(&f, &id).await, Action::Done);
        assert_eq!(status(&f, &id).await.phase, Phase::Failed);

        f.installer.heal_release("woocommerce-demo1").await;
        f.registry.request_retry(&id).await.unwrap();
        assert_eq!(pass(&f, &id).await, Action::Requeue(Duration::ZERO));
        let retried = status(&f, &id).await;
        assert_eq!(retried.phase, Phase::Provisioning);
        assert_eq!(retried.attempt, 2);
        assert!(retried.last_error.is_none());

        assert_eq!(pass(&f, &id).await, Action::Done);
        assert_eq!(status(&f, &id).await.phase, Phase::Ready);
    }

    #[tokio::test]
    async fn test_resume_pass_retries_failed_store() {
        let f = fixture(MockInstaller::new().with_delay(0), 1, Duration::from_secs(60));
        f.installer.fail_release("woocommerce-demo1").await;
        let id = create(&f, "demo1", "woocommerce").await;
        pass(&f, &id).await;
        f.installer.heal_release("woocommerce-demo1").await;

        let action = f
            .reconciler
            .reconcile(&id, PassKind::Resume, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(action, Action::Requeue(Duration::ZERO));
        assert_eq!(status(&f, &id).await.phase, Phase::Provisioning);
    }

    #[tokio::test]
    async fn test_unhealthy_release_is_polled_not_reinstalled() {
        let installer = MockInstaller::new()
            .with_delay(0)
            .with_installed_status(ReleaseStatus::PendingInstall);
        let f = fixture(installer, 1, Duration::from_secs(60));
        let id = create(&f, "demo1", "woocommerce").await;

        for _ in 0..4 {
            assert_eq!(pass(&f, &id).await, Action::Requeue(Timings::default().health_poll));
        }
        let polling = status(&f, &id).await;
        assert_eq!(polling.phase, Phase::Provisioning);
        assert_eq!(polling.release_name.as_deref(), Some("woocommerce-demo1"));
        assert_eq!(f.installer.install_count(), 1);
        assert!(f.reconciler.limiter().holds(&id).await);

        f.installer
            .set_status("woocommerce-demo1", "store-demo1", ReleaseStatus::Deployed)
            .await;
        assert_eq!(pass(&f, &id).await, Action::Done);
        let ready = status(&f, &id).await;
        assert_eq!(ready.phase, Phase::Ready);
        assert_eq!(f.installer.install_count(), 1);
        let releases = ready
            .events
            .iter()
            .filter(|e| e.step == Step::Release && e.outcome == Outcome::Succeeded)
            .count();
        assert_eq!(releases, 1);
    }

    #[tokio::test]
    async fn test_retry_reinstalls_once_per_attempt() {
        let installer = MockInstaller::new()
            .with_delay(0)
            .with_installed_status(ReleaseStatus::PendingInstall);
        let f = fixture(installer, 1, Duration::from_millis(300));
        let id = create(&f, "demo1", "woocommerce").await;

        pass(&f, &id).await;
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(pass(&f, &id).await, Action::Done);
        let failed = status(&f, &id).await;
        assert_eq!(failed.failure_kind, Some(FailureKind::ProvisionTimeout));

        f.installer
            .set_status("woocommerce-demo1", "store-demo1", ReleaseStatus::Failed)
            .await;
        f.registry.request_retry(&id).await.unwrap();
        assert_eq!(pass(&f, &id).await, Action::Requeue(Duration::ZERO));
        assert!(status(&f, &id).await.release_name.is_none());

        pass(&f, &id).await;
        assert_eq!(f.installer.install_count(), 2);
    }

    #[tokio::test]
    async fn test_transient_secret_read_is_retried() {
        let f = fixture(MockInstaller::new().with_delay(0), 1, Duration::from_secs(60));
        f.cluster.fail_gets(ObjectKind::Secret, 1).await;
        let id = create(&f, "demo1", "woocommerce").await;

        assert_eq!(pass(&f, &id).await, Action::Requeue(Timings::default().transient));
        let retrying = status(&f, &id).await;
        assert_eq!(retrying.phase, Phase::Provisioning);
        let last = retrying.events.last().unwrap();
        assert_eq!((last.step, last.outcome), (Step::AdminSecret, Outcome::Retrying));
        assert!(retrying.last_error.is_some());
        assert!(f.reconciler.limiter().holds(&id).await);

        assert_eq!(pass(&f, &id).await, Action::Done);
        let ready = status(&f, &id).await;
        assert_eq!(ready.phase, Phase::Ready);
        assert!(ready.last_error.is_none());
    }

    #[tokio::test]
    async fn test_automatic_retry_backs_off_and_stops_at_max_attempts() {
        let backoff = Duration::from_millis(50);
        let f = fixture_with_policy(
            MockInstaller::new().with_delay(0),
            1,
            Duration::from_secs(60),
            RetryPolicy::Automatic {
                backoff,
                max_attempts: 2,
            },
        );
        f.installer.fail_release("woocommerce-demo1").await;
        let id = create(&f, "demo1", "woocommerce").await;

        assert_eq!(pass(&f, &id).await, Action::Requeue(backoff));
        assert_eq!(status(&f, &id).await.phase, Phase::Failed);

        // Too early: the pass only reports the remaining wait.
        assert!(matches!(pass(&f, &id).await, Action::Requeue(d) if d > Duration::ZERO && d <= backoff));
        assert_eq!(status(&f, &id).await.attempt, 1);

        tokio::time::sleep(backoff).await;
        assert_eq!(pass(&f, &id).await, Action::Requeue(Duration::ZERO));
        assert_eq!(status(&f, &id).await.attempt, 2);

        // Second attempt fails and is the last one.
        assert_eq!(pass(&f, &id).await, Action::Done);
        for _ in 0..3 {
            assert_eq!(pass(&f, &id).await, Action::Done);
        }
        let status = status(&f, &id).await;
        assert_eq!(status.phase, Phase::Failed);
        assert_eq!(status.attempt, 2);
        assert_eq!(f.installer.install_count(), 2);
    }

    #[tokio::test]
    async fn test_manual_policy_ignores_resume_and_consumed_signals() {
        let f = fixture_with_policy(
            MockInstaller::new().with_delay(0),
            1,
            Duration::from_secs(60),
            RetryPolicy::Manual,
        );
        let busy = StoreId::parse("busy").unwrap();
        assert!(f.reconciler.limiter().try_acquire(&busy).await);
        f.installer.fail_release("woocommerce-demo1").await;
        let id = create(&f, "demo1", "woocommerce").await;

        // A retry requested while the attempt is still running belongs to it.
        assert!(matches!(pass(&f, &id).await, Action::WaitForSlot(_)));
        f.registry.request_retry(&id).await.unwrap();
        f.reconciler.limiter().release(&busy).await;
        assert_eq!(pass(&f, &id).await, Action::Done);
        let failed = status(&f, &id).await;
        assert_eq!(failed.phase, Phase::Failed);
        assert_eq!(failed.observed_retry_generation, 1);

        assert_eq!(pass(&f, &id).await, Action::Done);
        let resume = f
            .reconciler
            .reconcile(&id, PassKind::Resume, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resume, Action::Done);
        let still = status(&f, &id).await;
        assert_eq!(still.phase, Phase::Failed);
        assert_eq!(still.attempt, 1);
        assert_eq!(f.installer.install_count(), 1);

        // A signal sent after the failure is honoured.
        f.installer.heal_release("woocommerce-demo1").await;
        f.registry.request_retry(&id).await.unwrap();
        assert_eq!(pass(&f, &id).await, Action::Requeue(Duration::ZERO));
        assert_eq!(pass(&f, &id).await, Action::Done);
        assert_eq!(status(&f, &id).await.phase, Phase::Ready);
    }

    #[tokio::test]
    async fn test_delete_of_ready_store_cleans_up_and_removes() {
        let f = fixture(MockInstaller::new().with_delay(0), 1, Duration::from_secs(60));
        let id = create(&f, "demo1", "woocommerce").await;
        pass(&f, &id).await;

        assert_eq!(f.registry.request_delete(&id).await.unwrap(), DeleteIntent::Pending);
        assert_eq!(pass(&f, &id).await, Action::Done);

        assert!(f.registry.get(&id).await.unwrap().is_none());
        assert!(f.cluster.namespaces().await.is_empty());
        assert_eq!(f.installer.release_count().await, 0);
    }

    #[tokio::test]
    async fn test_delete_without_finalizer_removes_record() {
        let f = fixture(MockInstaller::new().with_delay(0), 1, Duration::from_secs(60));
        let id = create(&f, "demo1", "woocommerce").await;
        assert_eq!(f.registry.request_delete(&id).await.unwrap(), DeleteIntent::Removed);

        assert_eq!(pass(&f, &id).await, Action::Done);
        assert!(f.cluster.namespaces().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_pass_requeues_immediately() {
        let f = fixture(MockInstaller::never_completing(), 1, Duration::from_secs(60));
        let id = create(&f, "demo1", "woocommerce").await;
        let cancel = CancellationToken::new();

        let pass = {
            let reconciler = f.reconciler.clone();
            let id = id.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { reconciler.reconcile(&id, PassKind::Normal, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let action = pass.await.unwrap().unwrap();
        assert_eq!(action, Action::Requeue(Duration::ZERO));
        assert_eq!(status(&f, &id).await.phase, Phase::Provisioning);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_secs(30);
        assert_eq!(backoff_for(base, 1), Duration::from_secs(30));
        assert_eq!(backoff_for(base, 2), Duration::from_secs(60));
        assert_eq!(backoff_for(base, 3), Duration::from_secs(120));
        assert_eq!(backoff_for(base, 40), Duration::from_secs(3600));
    }

    #[test]
    fn test_install_error_classification() {
        let err = install_error(EngineError::Release(crate::release::ReleaseError::Other(
            "boom".to_string(),
        )));
        assert!(matches!(err, ReconcileError::ReleaseInstall(_)));

        let err = install_error(EngineError::Unsupported {
            engine: "x".to_string(),
            reason: "y".to_string(),
        });
        assert!(matches!(err, ReconcileError::UnsupportedEngine(_)));
    }
}
