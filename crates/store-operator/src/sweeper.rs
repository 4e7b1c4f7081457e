// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker removing orphaned store namespaces.
//!
//! A namespace labelled as managed whose store id has no registry record
//! is left over from a record that vanished without cleanup (for example a
//! manual database edit). The sweeper deletes such namespaces; the release
//! stored inside goes with them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterClient, DeleteOutcome, MANAGED_LABEL, ObjectKind, STORE_ID_LABEL};
use crate::error::Result;
use crate::registry::StoreRegistry;
use crate::store::StoreId;

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Managed namespaces inspected.
    pub scanned: usize,
    /// Orphaned namespaces deleted.
    pub deleted: usize,
}

/// Background worker that deletes managed namespaces without a store record.
pub struct OrphanSweeper {
    registry: Arc<dyn StoreRegistry>,
    cluster: Arc<dyn ClusterClient>,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl OrphanSweeper {
    /// Create a sweeper running every `interval`.
    pub fn new(
        registry: Arc<dyn StoreRegistry>,
        cluster: Arc<dyn ClusterClient>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            cluster,
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweeper loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(interval_secs = self.interval.as_secs(), "Orphan sweeper started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Orphan sweeper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Orphan sweep failed");
                    }
                }
            }
        }

        info!("Orphan sweeper stopped");
    }

    /// Run a single sweep.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let selector = format!("{MANAGED_LABEL}=true");
        let namespaces = self
            .cluster
            .list(ObjectKind::Namespace, None, &selector)
            .await?;

        let mut report = SweepReport {
            scanned: namespaces.len(),
            ..SweepReport::default()
        };

        for namespace in namespaces {
            if namespace.terminating {
                continue;
            }
            let Some(store_id) = namespace
                .label(STORE_ID_LABEL)
                .and_then(|raw| StoreId::parse(raw).ok())
            else {
                warn!(namespace = %namespace.key, "Managed namespace without a valid store id label");
                continue;
            };
            if self.registry.get(&store_id).await?.is_some() {
                continue;
            }

            if self.cluster.delete(&namespace.key).await? == DeleteOutcome::Deleted {
                info!(store_id = %store_id, namespace = %namespace.key, "Deleted orphaned namespace");
                report.deleted += 1;
            }
        }

        if report.deleted > 0 {
            info!(scanned = report.scanned, deleted = report.deleted, "Orphan sweep completed");
        } else {
            debug!(scanned = report.scanned, "Orphan sweep completed, nothing to delete");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterObject, InMemoryCluster, ObjectKey};
    use crate::registry::InMemoryRegistry;
    use crate::store::StoreSpec;

    fn managed(namespace: &str, store_id: &str) -> ClusterObject {
        ClusterObject::new(ObjectKey::namespace(namespace))
            .with_label(MANAGED_LABEL, "true")
            .with_label(STORE_ID_LABEL, store_id)
    }

    #[tokio::test]
    async fn test_sweep_deletes_only_orphans() {
        let registry = Arc::new(InMemoryRegistry::new());
        let cluster = Arc::new(InMemoryCluster::new());
        registry
            .create(&StoreSpec::new(StoreId::parse("live").unwrap(), "woocommerce"))
            .await
            .unwrap();
        cluster.insert(managed("store-live", "live")).await;
        cluster.insert(managed("store-gone", "gone")).await;
        cluster
            .insert(ClusterObject::new(ObjectKey::namespace("kube-system")))
            .await;

        let sweeper = OrphanSweeper::new(registry, cluster.clone(), Duration::from_secs(60));
        let report = sweeper.sweep().await.unwrap();

        assert_eq!(report, SweepReport { scanned: 2, deleted: 1 });
        assert!(cluster.contains(&ObjectKey::namespace("store-live")).await);
        assert!(!cluster.contains(&ObjectKey::namespace("store-gone")).await);
        assert!(cluster.contains(&ObjectKey::namespace("kube-system")).await);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let sweeper = OrphanSweeper::new(
            Arc::new(InMemoryRegistry::new()),
            Arc::new(InMemoryCluster::new()),
            Duration::from_secs(3600),
        );
        let shutdown = sweeper.shutdown_handle();
        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(1), sweeper.run())
            .await
            .unwrap();
    }
}
