// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for the store operator.
//!
//! [`ControllerRuntime`] wires the registry, cluster client and release
//! installer into a running dispatcher plus orphan sweeper. The binary uses
//! it with Postgres, the Kubernetes API and helm; tests use it with the
//! in-memory implementations.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use store_operator::runtime::ControllerRuntime;
//!
//! let runtime = ControllerRuntime::builder()
//!     .registry(registry)
//!     .cluster(Arc::new(KubeCluster::try_default().await?))
//!     .installer(Arc::new(HelmInstaller::new("helm", timeout)))
//!     .config(config)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! // ... run until asked to stop ...
//!
//! runtime.shutdown().await?;
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::cleanup::CleanupManager;
use crate::cluster::ClusterClient;
use crate::config::Config;
use crate::controller::{Controller, ControllerConfig};
use crate::engine::EngineRegistry;
use crate::guardrails::NamespaceProvisioner;
use crate::limiter::ProvisionLimiter;
use crate::reconciler::{Reconciler, Timings};
use crate::registry::StoreRegistry;
use crate::release::ReleaseInstaller;
use crate::status::StatusRecorder;
use crate::sweeper::OrphanSweeper;

/// Builder for creating a [`ControllerRuntime`].
#[derive(Default)]
pub struct ControllerRuntimeBuilder {
    registry: Option<Arc<dyn StoreRegistry>>,
    cluster: Option<Arc<dyn ClusterClient>>,
    installer: Option<Arc<dyn ReleaseInstaller>>,
    engines: Option<EngineRegistry>,
    config: Config,
    timings: Timings,
    controller: Option<ControllerConfig>,
}

impl ControllerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the store registry (required).
    pub fn registry(mut self, registry: Arc<dyn StoreRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the cluster client (required).
    pub fn cluster(mut self, cluster: Arc<dyn ClusterClient>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Set the release installer (required unless engines are supplied).
    pub fn installer(mut self, installer: Arc<dyn ReleaseInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    /// Replace the default engine handlers.
    pub fn engines(mut self, engines: EngineRegistry) -> Self {
        self.engines = Some(engines);
        self
    }

    /// Set the operator configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Override requeue delays.
    pub fn timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// Override dispatcher settings derived from the configuration.
    pub fn controller_config(mut self, controller: ControllerConfig) -> Self {
        self.controller = Some(controller);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<ControllerRuntimeConfig> {
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("registry is required"))?;
        let cluster = self
            .cluster
            .ok_or_else(|| anyhow::anyhow!("cluster is required"))?;
        let engines = match (self.engines, self.installer) {
            (Some(engines), _) => engines,
            (None, Some(installer)) => {
                EngineRegistry::with_defaults(self.config.engines.clone(), installer)
            }
            (None, None) => return Err(anyhow::anyhow!("installer or engines is required")),
        };
        let controller = self.controller.unwrap_or_else(|| ControllerConfig {
            workers: self.config.workers,
            resync_interval: self.config.resync_interval,
            ..ControllerConfig::default()
        });

        Ok(ControllerRuntimeConfig {
            registry,
            cluster,
            engines,
            config: self.config,
            timings: self.timings,
            controller,
        })
    }
}

/// Configuration for a [`ControllerRuntime`].
pub struct ControllerRuntimeConfig {
    registry: Arc<dyn StoreRegistry>,
    cluster: Arc<dyn ClusterClient>,
    engines: EngineRegistry,
    config: Config,
    timings: Timings,
    controller: ControllerConfig,
}

impl ControllerRuntimeConfig {
    /// Wire the components together without starting anything.
    pub fn reconciler(&self) -> Reconciler {
        let provisioner = NamespaceProvisioner::new(
            self.cluster.clone(),
            self.config.namespace_prefix.clone(),
            self.config.admin_secret_name.clone(),
        );
        let recorder = StatusRecorder::new(self.registry.clone(), self.config.max_status_events);
        let cleanup = CleanupManager::new(
            self.engines.clone(),
            self.cluster.clone(),
            provisioner.clone(),
            recorder.clone(),
        );
        Reconciler::new(
            self.registry.clone(),
            recorder,
            provisioner,
            self.engines.clone(),
            Arc::new(ProvisionLimiter::new(self.config.max_concurrent_provisions)),
            cleanup,
            self.config.max_provision,
            self.config.retry_policy,
        )
        .with_timings(self.timings)
    }

    /// Start the dispatcher and, if enabled, the orphan sweeper.
    pub async fn start(self) -> Result<ControllerRuntime> {
        let reconciler = self.reconciler();

        let controller = Controller::new(reconciler.clone(), self.controller.clone());
        let controller_shutdown = controller.shutdown_handle();
        let controller_handle = tokio::spawn(async move {
            controller.run().await;
        });

        let sweeper = self.config.orphan_sweep_interval.map(|interval| {
            let sweeper = OrphanSweeper::new(self.registry.clone(), self.cluster.clone(), interval);
            let shutdown = sweeper.shutdown_handle();
            let handle = tokio::spawn(async move {
                sweeper.run().await;
            });
            (handle, shutdown)
        });

        info!(
            workers = self.controller.workers,
            max_concurrent_provisions = self.config.max_concurrent_provisions,
            max_provision_secs = self.config.max_provision.as_secs(),
            engines = ?self.engines.names(),
            sweeper = sweeper.is_some(),
            "ControllerRuntime started"
        );

        Ok(ControllerRuntime {
            reconciler,
            controller_handle,
            controller_shutdown,
            sweeper,
        })
    }
}

/// A running store operator that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ControllerRuntime {
    reconciler: Reconciler,
    controller_handle: JoinHandle<()>,
    controller_shutdown: Arc<Notify>,
    sweeper: Option<(JoinHandle<()>, Arc<Notify>)>,
}

impl ControllerRuntime {
    /// Create a new runtime builder.
    pub fn builder() -> ControllerRuntimeBuilder {
        ControllerRuntimeBuilder::new()
    }

    /// The reconciler driven by this runtime.
    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Gracefully shut down the dispatcher and sweeper.
    pub async fn shutdown(self) -> Result<()> {
        info!("ControllerRuntime shutting down...");

        self.controller_shutdown.notify_one();
        if let Some((_, shutdown)) = &self.sweeper {
            shutdown.notify_one();
        }

        if let Some((handle, _)) = self.sweeper
            && let Err(e) = handle.await
        {
            error!("Orphan sweeper task panicked: {}", e);
        }

        match self.controller_handle.await {
            Ok(()) => {
                info!("ControllerRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("Controller task panicked: {}", e);
                Err(anyhow::anyhow!("controller task panicked: {}", e))
            }
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        let sweeper_running = self
            .sweeper
            .as_ref()
            .is_none_or(|(handle, _)| !handle.is_finished());
        !self.controller_handle.is_finished() && sweeper_running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;
    use crate::registry::InMemoryRegistry;

    #[test]
    fn test_build_requires_registry() {
        let result = ControllerRuntime::builder()
            .cluster(Arc::new(InMemoryCluster::new()))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_build_requires_installer_or_engines() {
        let result = ControllerRuntime::builder()
            .registry(Arc::new(InMemoryRegistry::new()))
            .cluster(Arc::new(InMemoryCluster::new()))
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let runtime = ControllerRuntime::builder()
            .registry(Arc::new(InMemoryRegistry::new()))
            .cluster(Arc::new(InMemoryCluster::new()))
            .installer(Arc::new(crate::release::MockInstaller::new()))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();
        assert!(runtime.is_running());
        runtime.shutdown().await.unwrap();
    }
}
