// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Store Operator - Store Lifecycle Controller
//!
//! This crate provisions isolated e-commerce stores in a shared cluster.
//! Each store record in the registry is driven to a running, reachable
//! store (its own namespace, guardrails, admin secret and workload release)
//! and, on deletion, torn down again before the record goes away.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     API service / dashboard                              │
//! │            (create, delete, retry, read store records)                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                     PostgreSQL store registry                          │
//! │          (desired spec, status, finalizer, NOTIFY on change)           │
//! └───────────────────────────────────────────────────────────────────────┘
//!                                    │ changes / resync
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                   store-operator (This Crate)                            │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │ Controller  │─►│ Reconciler  │─►│  Namespace  │  │   Engine    │     │
//! │  │ (dispatch)  │  │  (phases)   │  │ Provisioner │  │  Handlers   │     │
//! │  └─────────────┘  └──────┬──────┘  └──────┬──────┘  └──────┬──────┘     │
//! │                          │ admission       │                │            │
//! │                   ┌──────┴──────┐          │                │            │
//! │                   │   Limiter   │          │                │            │
//! │                   └─────────────┘          │                │            │
//! └────────────────────────────────────────────┼────────────────┼────────────┘
//!                                              ▼                ▼
//!                                   ┌──────────────────┐ ┌──────────────────┐
//!                                   │   Cluster API    │ │  helm releases   │
//!                                   └──────────────────┘ └──────────────────┘
//! ```
//!
//! # Store Phase State Machine
//!
//! ```text
//!        ┌──────────────┐  deadline / terminal error  ┌────────┐
//!   ───► │ Provisioning │ ───────────────────────────►│ Failed │
//!        └──────┬───────┘ ◄─────────────────────────  └───┬────┘
//!               │ healthy          retry signal           │
//!               ▼                                         │
//!        ┌──────────────┐                                 │
//!        │    Ready     │                                 │
//!        └──────┬───────┘                                 │
//!               │ delete                                  │ delete
//!               ▼                                         │
//!        ┌──────────────┐ ◄───────────────────────────────┘
//!        │   Deleting   │
//!        └──────┬───────┘
//!               ▼
//!        ┌──────────────┐
//!        │   Deleted    │  record removed once the finalizer is cleared
//!        └──────────────┘
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `STORE_OPERATOR_DATABASE_URL` | Yes* | - | PostgreSQL connection string |
//! | `DATABASE_URL` | Yes* | - | Fallback if above not set |
//! | `MAX_CONCURRENT_PROVISIONS` | No | `2` | Stores running heavy steps at once |
//! | `MAX_PROVISION_SECONDS` | No | `900` | Deadline per provisioning attempt |
//! | `MAX_STATUS_EVENTS` | No | `20` | Event timeline capacity per store |
//! | `OPERATOR_WORKERS` | No | `4` | Concurrent reconcile passes |
//! | `RESYNC_INTERVAL_SECS` | No | `60` | Full resync interval |
//! | `STORE_NS_PREFIX` | No | `store-` | Namespace prefix |
//! | `STORE_ADMIN_SECRET_NAME` | No | `store-admin` | Admin credential secret name |
//! | `RETRY_POLICY` | No | `resume` | `manual`, `resume` or `automatic` |
//! | `RETRY_BACKOFF_SECS` | No | `30` | First automatic retry delay |
//! | `RETRY_MAX_ATTEMPTS` | No | `3` | Attempts before automatic retries stop |
//! | `ORPHAN_SWEEP_INTERVAL_SECS` | No | `600` | Orphan sweep interval, `0` disables |
//! | `BASE_DOMAIN` | No | `127.0.0.1.nip.io` | Domain for store hosts |
//! | `URL_SCHEME` | No | `http` | Scheme of derived store URLs |
//! | `INGRESS_CLASS` | No | `nginx` | Ingress class passed to charts |
//! | `STORAGE_CLASS` | No | - | Storage class override |
//! | `CHART_WOOCOMMERCE` | No | `/charts/woocommerce` | WooCommerce chart |
//! | `CHART_MEDUSA` | No | `/charts/medusa` | Medusa chart |
//! | `HELM_BIN` | No | `helm` | helm executable |
//!
//! # Modules
//!
//! - [`cleanup`]: Finalizer-gated teardown
//! - [`cluster`]: Cluster API abstraction (Kubernetes and in-memory)
//! - [`config`]: Configuration from environment variables
//! - [`controller`]: Reconcile dispatcher
//! - [`engine`]: Per-engine install, health and URL strategies
//! - [`error`]: Error types
//! - [`guardrails`]: Namespace, quota, limits, network policies, admin secret
//! - [`limiter`]: Admission gate and provisioning deadline
//! - [`reconciler`]: Store lifecycle state machine
//! - [`registry`]: Store records (PostgreSQL and in-memory)
//! - [`release`]: Workload release tooling (helm and mock)
//! - [`runtime`]: Embeddable runtime
//! - [`status`]: Conflict-retrying status and event writes
//! - [`store`]: Store domain types
//! - [`sweeper`]: Orphaned namespace sweeper

#![deny(missing_docs)]

/// Database migrations for the store registry.
///
/// ```ignore
/// use store_operator::migrations;
///
/// let pool = PgPool::connect(&database_url).await?;
/// migrations::run(&pool).await?;
/// ```
pub mod migrations;

/// Operator configuration loaded from environment variables.
pub mod config;

/// Error types for operator operations.
pub mod error;

/// Store identifiers, phases, status and event timeline.
pub mod store;

/// Store record registry.
pub mod registry;

/// Cluster API abstraction.
pub mod cluster;

/// Workload release tooling.
pub mod release;

/// Engine handlers.
pub mod engine;

/// Namespace guardrails and admin credential.
pub mod guardrails;

/// Admission gate and provisioning deadline.
pub mod limiter;

/// Status and event recorder.
pub mod status;

/// Finalizer-gated teardown.
pub mod cleanup;

/// Store lifecycle state machine.
pub mod reconciler;

/// Reconcile dispatcher.
pub mod controller;

/// Background worker for removing orphaned namespaces.
pub mod sweeper;

/// Embeddable runtime.
pub mod runtime;
