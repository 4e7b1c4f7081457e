// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Store Operator - Store Lifecycle Controller
//!
//! A reconciliation controller responsible for:
//! - Provisioning isolated e-commerce stores (namespace, guardrails, release)
//! - Bounding concurrent installs and enforcing a provisioning deadline
//! - Finalizer-gated cleanup of deleted stores
//! - Sweeping namespaces left behind by vanished records

use std::sync::Arc;
use tracing::{error, info, warn};

use store_operator::cluster::KubeCluster;
use store_operator::config::Config;
use store_operator::migrations;
use store_operator::registry::PostgresRegistry;
use store_operator::release::{HelmInstaller, ReleaseInstaller};
use store_operator::runtime::ControllerRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "store_operator=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        max_concurrent_provisions = config.max_concurrent_provisions,
        max_provision_secs = config.max_provision.as_secs(),
        namespace_prefix = %config.namespace_prefix,
        base_domain = %config.engines.base_domain,
        retry_policy = ?config.retry_policy,
        "Starting Store Operator"
    );

    // Connect to database
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    info!("Connected to database");

    migrations::run(&pool).await?;

    info!("Database schema verified");

    // Registry plus change notifications
    let registry = Arc::new(PostgresRegistry::new(pool));
    let listener_shutdown = Arc::new(tokio::sync::Notify::new());
    let listener_handle = {
        let registry = registry.clone();
        let shutdown = listener_shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = registry.listen(shutdown).await {
                error!(error = %e, "Store change listener stopped");
            }
        })
    };

    // Cluster API client
    let cluster = Arc::new(KubeCluster::try_default().await?);
    info!("Connected to cluster API");

    // Release installer
    let installer = Arc::new(HelmInstaller::new(
        config.helm_bin.clone(),
        config.engines.install_timeout,
    ));
    info!(installer_type = installer.installer_type(), "Installer initialized");

    // Start the runtime
    let runtime = ControllerRuntime::builder()
        .registry(registry)
        .cluster(cluster)
        .installer(installer)
        .config(config)
        .build()?
        .start()
        .await?;

    info!("Store operator ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;
    listener_shutdown.notify_one();
    if let Err(e) = listener_handle.await {
        error!("Store change listener task panicked: {}", e);
    }

    info!("Store operator shut down");

    Ok(())
}
