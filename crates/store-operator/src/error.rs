// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the store operator.

use thiserror::Error;

use crate::cluster::ClusterError;
use crate::registry::RegistryError;
use crate::store::{FailureKind, Step};

/// Operator errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Registry operation failed.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Cluster API operation failed.
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),
}

/// Result type using the operator Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a single reconcile step.
///
/// Terminal variants move the store to `Failed`; the rest are retried with
/// backoff while the store stays in its current phase.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Cluster or registry error expected to clear on its own.
    #[error("{step}: {message}")]
    TransientInfra {
        /// Step that failed.
        step: Step,
        /// Error detail.
        message: String,
    },

    /// Workload release install or upgrade failed.
    #[error("release install failed: {0}")]
    ReleaseInstall(String),

    /// The provisioning deadline passed.
    #[error("deadline exceeded: provisioning took longer than {limit_secs}s (elapsed {elapsed_secs}s, during {step})")]
    ProvisionTimeout {
        /// Seconds since the attempt started.
        elapsed_secs: u64,
        /// Configured limit.
        limit_secs: u64,
        /// Step in progress when the deadline hit.
        step: Step,
    },

    /// A cleanup step failed; cleanup is retried.
    #[error("cleanup {step} failed: {message}")]
    Cleanup {
        /// Cleanup step that failed.
        step: Step,
        /// Error detail.
        message: String,
    },

    /// The engine is unsupported or not implemented.
    #[error("unsupported engine: {0}")]
    UnsupportedEngine(String),

    /// The store's namespace exists but is not owned by this store.
    #[error("namespace ownership conflict: {0}")]
    NamespaceOwnership(String),

    /// The existing admin credential secret is malformed.
    #[error("invalid admin credential: {0}")]
    InvalidCredential(String),

    /// The pass was cancelled because deletion was requested.
    #[error("cancelled by deletion request")]
    Cancelled,
}

impl ReconcileError {
    /// Wrap a cluster error as a transient failure of `step`.
    pub fn cluster(step: Step, err: ClusterError) -> Self {
        ReconcileError::TransientInfra {
            step,
            message: err.to_string(),
        }
    }

    /// Wrap a registry error as a transient failure of `step`.
    pub fn registry(step: Step, err: RegistryError) -> Self {
        ReconcileError::TransientInfra {
            step,
            message: err.to_string(),
        }
    }

    /// Whether the error moves the store to `Failed`.
    pub fn is_terminal(&self) -> bool {
        self.failure_kind().is_some()
    }

    /// Failure classification for terminal errors.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            ReconcileError::ReleaseInstall(_) => Some(FailureKind::ReleaseInstall),
            ReconcileError::ProvisionTimeout { .. } => Some(FailureKind::ProvisionTimeout),
            ReconcileError::UnsupportedEngine(_) => Some(FailureKind::UnsupportedEngine),
            ReconcileError::NamespaceOwnership(_) => Some(FailureKind::NamespaceOwnership),
            ReconcileError::InvalidCredential(_) => Some(FailureKind::InvalidCredential),
            ReconcileError::TransientInfra { .. }
            | ReconcileError::Cleanup { .. }
            | ReconcileError::Cancelled => None,
        }
    }

    /// Step the error is attributed to in the event timeline.
    pub fn step(&self) -> Step {
        match self {
            ReconcileError::TransientInfra { step, .. } => *step,
            ReconcileError::ReleaseInstall(_) => Step::Release,
            ReconcileError::ProvisionTimeout { .. } => Step::Deadline,
            ReconcileError::Cleanup { step, .. } => *step,
            ReconcileError::UnsupportedEngine(_) => Step::Engine,
            ReconcileError::NamespaceOwnership(_) => Step::Namespace,
            ReconcileError::InvalidCredential(_) => Step::AdminSecret,
            ReconcileError::Cancelled => Step::Deletion,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_classification() {
        assert!(ReconcileError::ReleaseInstall("boom".into()).is_terminal());
        assert!(ReconcileError::UnsupportedEngine("medusa".into()).is_terminal());
        assert!(
            ReconcileError::ProvisionTimeout {
                elapsed_secs: 901,
                limit_secs: 900,
                step: Step::Release,
            }
            .is_terminal()
        );
        assert!(
            !ReconcileError::TransientInfra {
                step: Step::Namespace,
                message: "connection refused".into(),
            }
            .is_terminal()
        );
        assert!(
            !ReconcileError::Cleanup {
                step: Step::Uninstall,
                message: "timeout".into(),
            }
            .is_terminal()
        );
        assert!(!ReconcileError::Cancelled.is_terminal());
    }

    #[test]
    fn test_timeout_message_names_step() {
        let err = ReconcileError::ProvisionTimeout {
            elapsed_secs: 12,
            limit_secs: 10,
            step: Step::HealthCheck,
        };
        assert_eq!(
            err.to_string(),
            "deadline exceeded: provisioning took longer than 10s (elapsed 12s, during health-check)"
        );
        assert_eq!(err.failure_kind(), Some(FailureKind::ProvisionTimeout));
    }
}
