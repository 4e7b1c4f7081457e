// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock installer for testing.
//!
//! Keeps releases in memory and simulates install time. Tracks how many
//! installs run at once so tests can check the admission bound.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::*;

#[derive(Debug, Clone)]
struct MockRelease {
    info: ReleaseInfo,
    values: BTreeMap<String, serde_json::Value>,
}

#[derive(Default)]
struct Faults {
    failing_releases: HashSet<String>,
    uninstall_failures: u32,
}

/// Decrements the in-flight counter when an install finishes or is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Mock installer for testing.
pub struct MockInstaller {
    releases: Arc<Mutex<HashMap<(String, String), MockRelease>>>,
    faults: Mutex<Faults>,
    /// Simulated install duration (in milliseconds)
    pub install_delay_ms: u64,
    /// If true, every install fails
    pub fail_by_default: bool,
    /// If true, installs never finish; the release stays `pending-install`
    /// until the install future is dropped.
    pub never_complete: bool,
    /// Status a successful install leaves the release in.
    pub installed_status: ReleaseStatus,
    installs: AtomicU64,
    uninstalls: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MockInstaller {
    fn default() -> Self {
        Self::new()
    }
}

impl MockInstaller {
    /// Create a mock installer.
    pub fn new() -> Self {
        Self {
            releases: Arc::new(Mutex::new(HashMap::new())),
            faults: Mutex::new(Faults::default()),
            install_delay_ms: 10,
            fail_by_default: false,
            never_complete: false,
            installed_status: ReleaseStatus::Deployed,
            installs: AtomicU64::new(0),
            uninstalls: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Create a mock installer whose installs always fail.
    pub fn failing() -> Self {
        Self {
            fail_by_default: true,
            ..Self::new()
        }
    }

    /// Create a mock installer whose installs never complete.
    pub fn never_completing() -> Self {
        Self {
            install_delay_ms: 0,
            never_complete: true,
            ..Self::new()
        }
    }

    /// Set the simulated install duration.
    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.install_delay_ms = delay_ms;
        self
    }

    /// Leave successfully installed releases in `status`, e.g. a workload
    /// that never turns healthy.
    pub fn with_installed_status(mut self, status: ReleaseStatus) -> Self {
        self.installed_status = status;
        self
    }

    /// Make installs of one release fail.
    pub async fn fail_release(&self, name: &str) {
        self.faults
            .lock()
            .await
            .failing_releases
            .insert(name.to_string());
    }

    /// Let installs of a previously failing release succeed.
    pub async fn heal_release(&self, name: &str) {
        self.faults.lock().await.failing_releases.remove(name);
    }

    /// Fail the next `times` uninstalls.
    pub async fn fail_uninstalls(&self, times: u32) {
        self.faults.lock().await.uninstall_failures = times;
    }

    /// Override the status of an existing release.
    pub async fn set_status(&self, name: &str, namespace: &str, status: ReleaseStatus) {
        let mut releases = self.releases.lock().await;
        if let Some(release) = releases.get_mut(&(namespace.to_string(), name.to_string())) {
            release.info.status = status;
        }
    }

    /// Values the release was last installed with.
    pub async fn values_of(
        &self,
        name: &str,
        namespace: &str,
    ) -> Option<BTreeMap<String, serde_json::Value>> {
        self.releases
            .lock()
            .await
            .get(&(namespace.to_string(), name.to_string()))
            .map(|r| r.values.clone())
    }

    /// Number of releases currently present.
    pub async fn release_count(&self) -> usize {
        self.releases.lock().await.len()
    }

    /// Total install calls.
    pub fn install_count(&self) -> u64 {
        self.installs.load(Ordering::SeqCst)
    }

    /// Total uninstall calls that removed a release.
    pub fn uninstall_count(&self) -> u64 {
        self.uninstalls.load(Ordering::SeqCst)
    }

    /// Highest number of installs observed running at once.
    pub fn max_concurrent_installs(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReleaseInstaller for MockInstaller {
    fn installer_type(&self) -> &'static str {
        "mock"
    }

    async fn install_or_upgrade(&self, request: &ReleaseRequest) -> Result<ReleaseHandle> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let key = (request.namespace.clone(), request.name.clone());
        let revision = {
            let mut releases = self.releases.lock().await;
            let entry = releases.entry(key.clone()).or_insert_with(|| MockRelease {
                info: ReleaseInfo {
                    name: request.name.clone(),
                    namespace: request.namespace.clone(),
                    revision: 0,
                    status: ReleaseStatus::PendingInstall,
                },
                values: request.values.clone(),
            });
            entry.info.revision += 1;
            if entry.info.revision > 1 {
                entry.info.status = ReleaseStatus::PendingUpgrade;
            }
            entry.info.revision
        };

        if self.never_complete {
            std::future::pending::<()>().await;
        }
        if self.install_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.install_delay_ms)).await;
        }

        let fail = self.fail_by_default
            || self
                .faults
                .lock()
                .await
                .failing_releases
                .contains(&request.name);

        let mut releases = self.releases.lock().await;
        if let Some(release) = releases.get_mut(&key) {
            release.values = request.values.clone();
            release.info.status = if fail {
                ReleaseStatus::Failed
            } else {
                self.installed_status.clone()
            };
        }

        if fail {
            return Err(ReleaseError::Command {
                operation: "install",
                release: request.name.clone(),
                exit_code: Some(1),
                stderr: "mock install failure".to_string(),
            });
        }

        Ok(ReleaseHandle {
            name: request.name.clone(),
            namespace: request.namespace.clone(),
            revision: Some(revision),
        })
    }

    async fn uninstall(&self, name: &str, namespace: &str) -> Result<UninstallOutcome> {
        {
            let mut faults = self.faults.lock().await;
            if faults.uninstall_failures > 0 {
                faults.uninstall_failures -= 1;
                return Err(ReleaseError::Other("mock uninstall failure".to_string()));
            }
        }
        let removed = self
            .releases
            .lock()
            .await
            .remove(&(namespace.to_string(), name.to_string()));
        match removed {
            Some(_) => {
                self.uninstalls.fetch_add(1, Ordering::SeqCst);
                Ok(UninstallOutcome::Uninstalled)
            }
            None => Ok(UninstallOutcome::NotFound),
        }
    }

    async fn status(&self, name: &str, namespace: &str) -> Result<Option<ReleaseInfo>> {
        Ok(self
            .releases
            .lock()
            .await
            .get(&(namespace.to_string(), name.to_string()))
            .map(|r| r.info.clone()))
    }
}
