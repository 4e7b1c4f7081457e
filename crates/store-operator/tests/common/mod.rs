// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for store-operator lifecycle tests.
//!
//! Provides TestContext wiring the in-memory registry and cluster plus the
//! mock installer into a running controller runtime.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use store_operator::cluster::InMemoryCluster;
use store_operator::config::Config;
use store_operator::controller::ControllerConfig;
use store_operator::reconciler::Timings;
use store_operator::registry::{InMemoryRegistry, StoreRegistry};
use store_operator::release::MockInstaller;
use store_operator::runtime::ControllerRuntime;
use store_operator::store::{Phase, StoreId, StoreRecord, StoreSpec};

/// Requeue delays short enough for tests.
pub fn fast_timings() -> Timings {
    Timings {
        transient: Duration::from_millis(50),
        health_poll: Duration::from_millis(50),
        terminating_poll: Duration::from_millis(50),
        admission_poll: Duration::from_millis(200),
    }
}

/// Configuration with test-friendly defaults.
pub fn test_config() -> Config {
    Config {
        database_url: "postgres://unused".to_string(),
        max_concurrent_provisions: 2,
        max_provision: Duration::from_secs(30),
        workers: 8,
        resync_interval: Duration::from_secs(1),
        orphan_sweep_interval: None,
        ..Config::default()
    }
}

/// Test context that manages the registry, cluster and a running runtime.
pub struct TestContext {
    pub registry: Arc<InMemoryRegistry>,
    pub cluster: Arc<InMemoryCluster>,
    pub installer: Arc<MockInstaller>,
    pub config: Config,
    pub runtime: Option<ControllerRuntime>,
}

impl TestContext {
    /// Start a runtime with the default test configuration.
    pub async fn new(installer: MockInstaller) -> Self {
        Self::with_config(installer, test_config()).await
    }

    /// Start a runtime with a custom configuration.
    pub async fn with_config(installer: MockInstaller, config: Config) -> Self {
        Self::over(
            Arc::new(InMemoryRegistry::new()),
            Arc::new(InMemoryCluster::new()),
            Arc::new(installer),
            config,
        )
        .await
    }

    /// Start a runtime over existing state, as after a controller restart.
    pub async fn over(
        registry: Arc<InMemoryRegistry>,
        cluster: Arc<InMemoryCluster>,
        installer: Arc<MockInstaller>,
        config: Config,
    ) -> Self {
        let mut ctx = Self {
            registry,
            cluster,
            installer,
            config,
            runtime: None,
        };
        ctx.start().await;
        ctx
    }

    /// Start (or restart) the runtime.
    pub async fn start(&mut self) {
        let runtime = ControllerRuntime::builder()
            .registry(self.registry.clone())
            .cluster(self.cluster.clone())
            .installer(self.installer.clone())
            .config(self.config.clone())
            .timings(fast_timings())
            .controller_config(ControllerConfig {
                workers: self.config.workers,
                resync_interval: self.config.resync_interval,
                error_backoff: Duration::from_millis(50),
                startup_retry: Duration::from_millis(50),
            })
            .build()
            .expect("Failed to build runtime")
            .start()
            .await
            .expect("Failed to start runtime");
        self.runtime = Some(runtime);
    }

    /// Stop the runtime, keeping registry and cluster state.
    pub async fn stop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown().await.expect("Failed to shut down runtime");
        }
    }

    /// The running runtime.
    pub fn runtime(&self) -> &ControllerRuntime {
        self.runtime.as_ref().expect("runtime not started")
    }

    /// Create a store record.
    pub async fn create(&self, raw: &str, engine: &str) -> StoreId {
        let id = StoreId::parse(raw).expect("invalid store id");
        self.registry
            .create(&StoreSpec::new(id.clone(), engine))
            .await
            .expect("Failed to create store");
        id
    }

    /// Current record, if any.
    pub async fn record(&self, id: &StoreId) -> Option<StoreRecord> {
        self.registry.get(id).await.expect("registry get failed")
    }

    /// Poll until the store reaches `phase`.
    pub async fn wait_for_phase(&self, id: &StoreId, phase: Phase, timeout: Duration) -> StoreRecord {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(record) = self.record(id).await
                && record.phase() == Some(phase)
            {
                return record;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{id} did not reach {phase} within {timeout:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll until `done` holds for the store record.
    pub async fn wait_until<F>(&self, id: &StoreId, timeout: Duration, done: F) -> StoreRecord
    where
        F: Fn(&StoreRecord) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(record) = self.record(id).await
                && done(&record)
            {
                return record;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{id} did not reach the expected state within {timeout:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll until the store record is gone.
    pub async fn wait_for_removal(&self, id: &StoreId, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.record(id).await.is_some() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "{id} was not removed within {timeout:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            // Best effort; tests normally stop explicitly.
            tokio::spawn(async move {
                let _ = runtime.shutdown().await;
            });
        }
    }
}

/// Helper macro to skip tests if database URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_STORE_OPERATOR_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_STORE_OPERATOR_DATABASE_URL not set");
            return;
        }
    };
}
