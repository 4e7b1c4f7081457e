// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Release installer backed by the `helm` CLI.
//!
//! Every invocation runs with `kill_on_drop`, so dropping an install future
//! (deadline, delete) kills the subprocess. Helm then leaves the release in
//! a `pending-*` state, which the next install attempt repairs before
//! running `upgrade --install`.

use std::path::PathBuf;
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::*;

#[derive(Debug, Deserialize)]
struct HelmStatus {
    name: String,
    namespace: String,
    version: u32,
    info: HelmStatusInfo,
}

#[derive(Debug, Deserialize)]
struct HelmStatusInfo {
    status: ReleaseStatus,
}

/// [`ReleaseInstaller`] shelling out to `helm`.
#[derive(Debug, Clone)]
pub struct HelmInstaller {
    helm_bin: PathBuf,
    timeout: Duration,
}

impl HelmInstaller {
    /// Create an installer; `timeout` is passed to `--timeout`.
    pub fn new(helm_bin: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            helm_bin: helm_bin.into(),
            timeout,
        }
    }

    fn timeout_arg(&self) -> String {
        format!("--timeout={}s", self.timeout.as_secs().max(1))
    }

    async fn run(&self, args: &[String]) -> Result<Output> {
        debug!(helm = %self.helm_bin.display(), args = ?args, "Running helm");
        let output = Command::new(&self.helm_bin)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(output)
    }

    async fn run_checked(&self, operation: &'static str, release: &str, args: &[String]) -> Result<Output> {
        let output = self.run(args).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(command_error(operation, release, &output))
        }
    }

    /// Clear a lock left by an abandoned operation.
    async fn repair(&self, info: &ReleaseInfo) -> Result<()> {
        match info.status {
            ReleaseStatus::PendingInstall => {
                warn!(release = %info.name, namespace = %info.namespace, "Removing release stuck in pending-install");
                self.uninstall(&info.name, &info.namespace).await?;
            }
            ReleaseStatus::PendingUpgrade | ReleaseStatus::PendingRollback => {
                warn!(release = %info.name, namespace = %info.namespace, status = ?info.status, "Rolling back stuck release");
                let args = vec![
                    "rollback".to_string(),
                    info.name.clone(),
                    "-n".to_string(),
                    info.namespace.clone(),
                    "--wait".to_string(),
                    self.timeout_arg(),
                ];
                self.run_checked("rollback", &info.name, &args).await?;
            }
            _ => {}
        }
        Ok(())
    }
}

fn command_error(operation: &'static str, release: &str, output: &Output) -> ReleaseError {
    ReleaseError::Command {
        operation,
        release: release.to_string(),
        exit_code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

fn is_not_found(output: &Output) -> bool {
    String::from_utf8_lossy(&output.stderr)
        .to_ascii_lowercase()
        .contains("not found")
}

/// Escape characters `--set` treats as separators.
fn escape_value(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace(',', "\\,")
}

/// Build the `upgrade --install` argument list.
fn install_args(request: &ReleaseRequest, timeout_arg: String) -> Vec<String> {
    let mut args = vec![
        "upgrade".to_string(),
        "--install".to_string(),
        request.name.clone(),
        request.chart.clone(),
        "-n".to_string(),
        request.namespace.clone(),
        "--wait".to_string(),
        timeout_arg,
    ];
    for (key, value) in &request.values {
        match value {
            serde_json::Value::String(s) => {
                args.push("--set-string".to_string());
                args.push(format!("{key}={}", escape_value(s)));
            }
            other => {
                args.push("--set".to_string());
                args.push(format!("{key}={other}"));
            }
        }
    }
    args
}

#[async_trait]
impl ReleaseInstaller for HelmInstaller {
    fn installer_type(&self) -> &'static str {
        "helm"
    }

    async fn install_or_upgrade(&self, request: &ReleaseRequest) -> Result<ReleaseHandle> {
        if let Some(existing) = self.status(&request.name, &request.namespace).await?
            && existing.status.is_pending()
        {
            self.repair(&existing).await?;
        }

        info!(release = %request.name, namespace = %request.namespace, chart = %request.chart, "Installing release");
        self.run_checked(
            "install",
            &request.name,
            &install_args(request, self.timeout_arg()),
        )
        .await?;

        let revision = self
            .status(&request.name, &request.namespace)
            .await?
            .map(|info| info.revision);

        Ok(ReleaseHandle {
            name: request.name.clone(),
            namespace: request.namespace.clone(),
            revision,
        })
    }

    async fn uninstall(&self, name: &str, namespace: &str) -> Result<UninstallOutcome> {
        let args = vec![
            "uninstall".to_string(),
            name.to_string(),
            "-n".to_string(),
            namespace.to_string(),
            "--wait".to_string(),
            self.timeout_arg(),
        ];
        let output = self.run(&args).await?;
        if output.status.success() {
            info!(release = %name, namespace = %namespace, "Uninstalled release");
            Ok(UninstallOutcome::Uninstalled)
        } else if is_not_found(&output) {
            debug!(release = %name, namespace = %namespace, "Release already absent");
            Ok(UninstallOutcome::NotFound)
        } else {
            Err(command_error("uninstall", name, &output))
        }
    }

    async fn status(&self, name: &str, namespace: &str) -> Result<Option<ReleaseInfo>> {
        let args = vec![
            "status".to_string(),
            name.to_string(),
            "-n".to_string(),
            namespace.to_string(),
            "-o".to_string(),
            "json".to_string(),
        ];
        let output = self.run(&args).await?;
        if !output.status.success() {
            if is_not_found(&output) {
                return Ok(None);
            }
            return Err(command_error("status", name, &output));
        }
        let parsed: HelmStatus = serde_json::from_slice(&output.stdout)?;
        Ok(Some(ReleaseInfo {
            name: parsed.name,
            namespace: parsed.namespace,
            revision: parsed.version,
            status: parsed.info.status,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_install_args() {
        let mut values = BTreeMap::new();
        values.insert("wordpress.ingress.enabled".to_string(), json!(true));
        values.insert("wordpress.wordpressPassword".to_string(), json!("a,b"));
        let request = ReleaseRequest {
            name: "woocommerce-demo1".to_string(),
            namespace: "store-demo1".to_string(),
            chart: "/charts/woocommerce".to_string(),
            values,
        };

        let args = install_args(&request, "--timeout=900s".to_string());
        assert_eq!(
            &args[..8],
            &[
                "upgrade",
                "--install",
                "woocommerce-demo1",
                "/charts/woocommerce",
                "-n",
                "store-demo1",
                "--wait",
                "--timeout=900s",
            ]
        );
        assert!(args.windows(2).any(|w| w[0] == "--set" && w[1] == "wordpress.ingress.enabled=true"));
        assert!(
            args.windows(2)
                .any(|w| w[0] == "--set-string" && w[1] == "wordpress.wordpressPassword=a\\,b")
        );
    }

    #[test]
    fn test_helm_status_parses() {
        let raw = r#"{"name":"woocommerce-demo1","namespace":"store-demo1","version":3,
                      "info":{"status":"pending-install","description":"x"},"manifest":""}"#;
        let parsed: HelmStatus = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.version, 3);
        assert_eq!(parsed.info.status, ReleaseStatus::PendingInstall);
    }

    #[test]
    fn test_timeout_arg_has_floor() {
        let installer = HelmInstaller::new("helm", Duration::from_millis(10));
        assert_eq!(installer.timeout_arg(), "--timeout=1s");
    }
}
