// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workload release installer.
//!
//! A release is a named installation of a templated workload package into a
//! namespace. `install_or_upgrade` installs when absent and upgrades in place
//! otherwise; `uninstall` treats an absent release as success. Both may be
//! abandoned mid-flight (deadline, delete) and must leave the next attempt
//! able to proceed.

pub mod helm;
pub mod mock;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

pub use helm::HelmInstaller;
pub use mock::MockInstaller;

/// Errors from release operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReleaseError {
    /// The release tool exited unsuccessfully.
    #[error("{operation} of {release} failed (exit {exit_code:?}): {stderr}")]
    Command {
        /// Operation that failed.
        operation: &'static str,
        /// Release name.
        release: String,
        /// Exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Standard error output.
        stderr: String,
    },

    /// The release tool could not be started.
    #[error("Failed to run release tool: {0}")]
    Spawn(#[from] std::io::Error),

    /// Release tool output could not be parsed.
    #[error("Unparseable release status: {0}")]
    Parse(#[from] serde_json::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type for release operations.
pub type Result<T> = std::result::Result<T, ReleaseError>;

/// Install or upgrade request.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseRequest {
    /// Release name.
    pub name: String,
    /// Target namespace.
    pub namespace: String,
    /// Chart reference (path, repo/chart or OCI URL).
    pub chart: String,
    /// Value overrides keyed by dotted path.
    pub values: BTreeMap<String, serde_json::Value>,
}

/// Lifecycle status of a release.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum ReleaseStatus {
    /// Installed and healthy from the tool's point of view.
    Deployed,
    /// Last operation failed.
    Failed,
    /// Install in progress or abandoned mid-install.
    PendingInstall,
    /// Upgrade in progress or abandoned mid-upgrade.
    PendingUpgrade,
    /// Rollback in progress or abandoned mid-rollback.
    PendingRollback,
    /// Uninstall in progress.
    Uninstalling,
    /// Any other status string.
    Other(String),
}

impl From<String> for ReleaseStatus {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "deployed" => ReleaseStatus::Deployed,
            "failed" => ReleaseStatus::Failed,
            "pending-install" => ReleaseStatus::PendingInstall,
            "pending-upgrade" => ReleaseStatus::PendingUpgrade,
            "pending-rollback" => ReleaseStatus::PendingRollback,
            "uninstalling" => ReleaseStatus::Uninstalling,
            _ => ReleaseStatus::Other(raw),
        }
    }
}

impl ReleaseStatus {
    /// Whether an earlier operation was interrupted and left the release locked.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ReleaseStatus::PendingInstall
                | ReleaseStatus::PendingUpgrade
                | ReleaseStatus::PendingRollback
        )
    }
}

/// Observed release state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseInfo {
    /// Release name.
    pub name: String,
    /// Namespace.
    pub namespace: String,
    /// Revision number.
    pub revision: u32,
    /// Current status.
    pub status: ReleaseStatus,
}

/// Handle returned by a completed install or upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseHandle {
    /// Release name.
    pub name: String,
    /// Namespace.
    pub namespace: String,
    /// Revision after the operation, when known.
    pub revision: Option<u32>,
}

/// Outcome of an uninstall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UninstallOutcome {
    /// The release was removed.
    Uninstalled,
    /// There was no release to remove.
    NotFound,
}

/// Installs, upgrades and removes releases.
#[async_trait]
pub trait ReleaseInstaller: Send + Sync {
    /// Returns the installer type identifier.
    fn installer_type(&self) -> &'static str;

    /// Install the release, or upgrade it in place if it exists.
    async fn install_or_upgrade(&self, request: &ReleaseRequest) -> Result<ReleaseHandle>;

    /// Remove the release; an absent release is a no-op success.
    async fn uninstall(&self, name: &str, namespace: &str) -> Result<UninstallOutcome>;

    /// Current release state, `None` when absent.
    async fn status(&self, name: &str, namespace: &str) -> Result<Option<ReleaseInfo>>;
}
