// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Namespace and guardrail provisioning.
//!
//! [`NamespaceProvisioner::ensure`] walks a fixed list of objects, top to
//! bottom, on every call:
//!
//! 1. namespace (labelled with the owning store)
//! 2. `store-quota` resource quota
//! 3. `store-limits` limit range
//! 4. `default-deny` network policy
//! 5. `allow-required` network policy
//! 6. admin credential secret
//!
//! Each object is read first and only created when absent, so a partially
//! provisioned namespace converges on the next call and a converged one is
//! left untouched. The admin secret is generated once and never rewritten.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::distributions::{Alphanumeric, DistString};
use serde_json::json;
use tracing::{debug, info};

use crate::cluster::{
    ClusterClient, ClusterObject, CreateOutcome, MANAGED_LABEL, ObjectKey, ObjectKind,
    STORE_ID_LABEL,
};
use crate::error::ReconcileError;
use crate::store::{StoreId, Step};

/// Resource quota name.
pub const QUOTA_NAME: &str = "store-quota";
/// Limit range name.
pub const LIMIT_RANGE_NAME: &str = "store-limits";
/// Default-deny network policy name.
pub const DEFAULT_DENY_POLICY: &str = "default-deny";
/// Network policy with the allows the workload needs.
pub const ALLOW_REQUIRED_POLICY: &str = "allow-required";
/// Namespace of the ingress controller allowed to reach store pods.
pub const INGRESS_NAMESPACE: &str = "ingress-nginx";
/// Admin username written to new credential secrets.
pub const ADMIN_USERNAME: &str = "admin";
/// Length of generated admin passwords.
pub const ADMIN_PASSWORD_LEN: usize = 24;

/// Admin credential for a store's workload.
#[derive(Clone, PartialEq, Eq)]
pub struct AdminCredential {
    /// Admin username.
    pub username: String,
    /// Admin password.
    pub password: String,
}

impl std::fmt::Debug for AdminCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminCredential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl AdminCredential {
    /// Generate a fresh credential.
    pub fn generate() -> Self {
        Self {
            username: ADMIN_USERNAME.to_string(),
            password: Alphanumeric.sample_string(&mut rand::thread_rng(), ADMIN_PASSWORD_LEN),
        }
    }

    /// Read a credential from a secret's `data` (base64) or `stringData`.
    pub fn from_secret(secret: &ClusterObject) -> Result<Self, String> {
        let field = |name: &str| -> Result<String, String> {
            if let Some(encoded) = secret.body.get("data").and_then(|d| d.get(name)) {
                let encoded = encoded
                    .as_str()
                    .ok_or_else(|| format!("data.{name} is not a string"))?;
                let bytes = BASE64
                    .decode(encoded)
                    .map_err(|e| format!("data.{name} is not base64: {e}"))?;
                return String::from_utf8(bytes).map_err(|_| format!("data.{name} is not UTF-8"));
            }
            secret
                .body
                .get("stringData")
                .and_then(|d| d.get(name))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| format!("missing field {name}"))
        };

        let username = field("username")?;
        let password = field("password")?;
        if username.is_empty() || password.is_empty() {
            return Err("username and password must be non-empty".to_string());
        }
        Ok(Self { username, password })
    }
}

/// Result of an `ensure` call.
#[derive(Debug, Clone)]
pub struct EnsureReport {
    /// Namespace holding the store.
    pub namespace: String,
    /// Objects created by this call, in creation order.
    pub created: Vec<(Step, ObjectKey)>,
    /// Admin credential, existing or newly generated.
    pub credential: AdminCredential,
}

/// Idempotent namespace and guardrail provisioner.
#[derive(Clone)]
pub struct NamespaceProvisioner {
    cluster: Arc<dyn ClusterClient>,
    namespace_prefix: String,
    admin_secret_name: String,
}

impl NamespaceProvisioner {
    /// Create a provisioner.
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        namespace_prefix: impl Into<String>,
        admin_secret_name: impl Into<String>,
    ) -> Self {
        Self {
            cluster,
            namespace_prefix: namespace_prefix.into(),
            admin_secret_name: admin_secret_name.into(),
        }
    }

    /// Namespace name for a store.
    pub fn namespace_for(&self, store_id: &StoreId) -> String {
        format!("{}{}", self.namespace_prefix, store_id)
    }

    /// Name of the admin credential secret.
    pub fn admin_secret_name(&self) -> &str {
        &self.admin_secret_name
    }

    /// Converge the store's namespace, guardrails and admin secret.
    pub async fn ensure(&self, store_id: &StoreId) -> Result<EnsureReport, ReconcileError> {
        let namespace = self.namespace_for(store_id);
        let mut created = Vec::new();

        self.ensure_namespace(store_id, &namespace, &mut created)
            .await?;

        for (step, object) in guardrail_objects(store_id, &namespace) {
            self.ensure_object(step, object, &mut created).await?;
        }

        let credential = self
            .ensure_admin_secret(store_id, &namespace, &mut created)
            .await?;

        if created.is_empty() {
            debug!(store_id = %store_id, namespace = %namespace, "Guardrails already converged");
        } else {
            info!(
                store_id = %store_id,
                namespace = %namespace,
                created = created.len(),
                "Guardrails provisioned"
            );
        }

        Ok(EnsureReport {
            namespace,
            created,
            credential,
        })
    }

    async fn ensure_namespace(
        &self,
        store_id: &StoreId,
        namespace: &str,
        created: &mut Vec<(Step, ObjectKey)>,
    ) -> Result<(), ReconcileError> {
        let key = ObjectKey::namespace(namespace);
        let existing = self
            .cluster
            .get(&key)
            .await
            .map_err(|e| ReconcileError::cluster(Step::Namespace, e))?;

        match existing {
            Some(ns) => {
                if !is_owned_by(&ns, store_id) {
                    return Err(ReconcileError::NamespaceOwnership(format!(
                        "namespace {namespace} exists but is not managed for store {store_id}"
                    )));
                }
                if ns.terminating {
                    return Err(ReconcileError::TransientInfra {
                        step: Step::Namespace,
                        message: format!("namespace {namespace} is still terminating"),
                    });
                }
                Ok(())
            }
            None => {
                let object = ClusterObject::new(key.clone())
                    .with_label(MANAGED_LABEL, "true")
                    .with_label(STORE_ID_LABEL, store_id.as_str());
                self.ensure_created(Step::Namespace, object, created).await
            }
        }
    }

    async fn ensure_object(
        &self,
        step: Step,
        object: ClusterObject,
        created: &mut Vec<(Step, ObjectKey)>,
    ) -> Result<(), ReconcileError> {
        let existing = self
            .cluster
            .get(&object.key)
            .await
            .map_err(|e| ReconcileError::cluster(step, e))?;
        if existing.is_some() {
            return Ok(());
        }
        self.ensure_created(step, object, created).await
    }

    async fn ensure_created(
        &self,
        step: Step,
        object: ClusterObject,
        created: &mut Vec<(Step, ObjectKey)>,
    ) -> Result<(), ReconcileError> {
        let outcome = self
            .cluster
            .create(&object)
            .await
            .map_err(|e| ReconcileError::cluster(step, e))?;
        if outcome == CreateOutcome::Created {
            debug!(object = %object.key, "Created guardrail object");
            created.push((step, object.key));
        }
        Ok(())
    }

    async fn ensure_admin_secret(
        &self,
        store_id: &StoreId,
        namespace: &str,
        created: &mut Vec<(Step, ObjectKey)>,
    ) -> Result<AdminCredential, ReconcileError> {
        let key = ObjectKey::namespaced(ObjectKind::Secret, namespace, &self.admin_secret_name);
        if let Some(secret) = self.read_secret(&key).await? {
            return AdminCredential::from_secret(&secret)
                .map_err(|e| ReconcileError::InvalidCredential(format!("{key}: {e}")));
        }

        let credential = AdminCredential::generate();
        let object = ClusterObject::new(key.clone())
            .with_label(STORE_ID_LABEL, store_id.as_str())
            .with_body(json!({
                "type": "Opaque",
                "stringData": {
                    "username": credential.username,
                    "password": credential.password,
                    "storeId": store_id.as_str(),
                }
            }));

        let outcome = self
            .cluster
            .create(&object)
            .await
            .map_err(|e| ReconcileError::cluster(Step::AdminSecret, e))?;

        match outcome {
            CreateOutcome::Created => {
                created.push((Step::AdminSecret, key));
                Ok(credential)
            }
            // Lost a race with a concurrent writer; the stored secret wins.
            CreateOutcome::AlreadyExists => {
                let secret = self.read_secret(&key).await?.ok_or_else(|| {
                    ReconcileError::TransientInfra {
                        step: Step::AdminSecret,
                        message: format!("{key} vanished after create conflict"),
                    }
                })?;
                AdminCredential::from_secret(&secret)
                    .map_err(|e| ReconcileError::InvalidCredential(format!("{key}: {e}")))
            }
        }
    }

    async fn read_secret(&self, key: &ObjectKey) -> Result<Option<ClusterObject>, ReconcileError> {
        self.cluster
            .get(key)
            .await
            .map_err(|e| ReconcileError::cluster(Step::AdminSecret, e))
    }
}

/// Whether a namespace carries the ownership labels for `store_id`.
pub fn is_owned_by(namespace: &ClusterObject, store_id: &StoreId) -> bool {
    namespace.label(MANAGED_LABEL) == Some("true")
        && namespace.label(STORE_ID_LABEL) == Some(store_id.as_str())
}

fn guardrail_objects(store_id: &StoreId, namespace: &str) -> Vec<(Step, ClusterObject)> {
    let labelled = |kind: ObjectKind, name: &str| {
        ClusterObject::new(ObjectKey::namespaced(kind, namespace, name))
            .with_label(STORE_ID_LABEL, store_id.as_str())
    };

    vec![
        (
            Step::ResourceQuota,
            labelled(ObjectKind::ResourceQuota, QUOTA_NAME).with_body(json!({
                "spec": {
                    "hard": {
                        "pods": "10",
                        "requests.cpu": "2",
                        "requests.memory": "2Gi",
                        "limits.cpu": "4",
                        "limits.memory": "4Gi",
                        "persistentvolumeclaims": "5",
                        "requests.storage": "20Gi",
                    }
                }
            })),
        ),
        (
            Step::LimitRange,
            labelled(ObjectKind::LimitRange, LIMIT_RANGE_NAME).with_body(json!({
                "spec": {
                    "limits": [{
                        "type": "Container",
                        "default": {"cpu": "500m", "memory": "512Mi"},
                        "defaultRequest": {"cpu": "200m", "memory": "256Mi"},
                    }]
                }
            })),
        ),
        (
            Step::NetworkPolicy,
            labelled(ObjectKind::NetworkPolicy, DEFAULT_DENY_POLICY).with_body(json!({
                "spec": {
                    "podSelector": {},
                    "policyTypes": ["Ingress", "Egress"],
                }
            })),
        ),
        (
            Step::NetworkPolicy,
            labelled(ObjectKind::NetworkPolicy, ALLOW_REQUIRED_POLICY).with_body(json!({
                "spec": {
                    "podSelector": {},
                    "policyTypes": ["Ingress", "Egress"],
                    "ingress": [
                        {"from": [{"namespaceSelector": {"matchLabels": {
                            "kubernetes.io/metadata.name": INGRESS_NAMESPACE
                        }}}]},
                        {"from": [{"podSelector": {}}]},
                    ],
                    "egress": [
                        {"to": [{"podSelector": {}}]},
                        {
                            "to": [{"namespaceSelector": {"matchLabels": {
                                "kubernetes.io/metadata.name": "kube-system"
                            }}}],
                            "ports": [
                                {"protocol": "UDP", "port": 53},
                                {"protocol": "TCP", "port": 53},
                            ],
                        },
                        {
                            "to": [{"ipBlock": {"cidr": "0.0.0.0/0"}}],
                            "ports": [
                                {"protocol": "TCP", "port": 443},
                                {"protocol": "TCP", "port": 80},
                            ],
                        },
                    ],
                }
            })),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;

    fn provisioner(cluster: &Arc<InMemoryCluster>) -> NamespaceProvisioner {
        NamespaceProvisioner::new(cluster.clone(), "store-", "store-admin")
    }

    fn id(raw: &str) -> StoreId {
        StoreId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_ensure_creates_everything_once() {
        let cluster = Arc::new(InMemoryCluster::new());
        let provisioner = provisioner(&cluster);

        let first = provisioner.ensure(&id("demo1")).await.unwrap();
        assert_eq!(first.namespace, "store-demo1");
        let steps: Vec<Step> = first.created.iter().map(|(s, _)| *s).collect();
        assert_eq!(
            steps,
            vec![
                Step::Namespace,
                Step::ResourceQuota,
                Step::LimitRange,
                Step::NetworkPolicy,
                Step::NetworkPolicy,
                Step::AdminSecret,
            ]
        );
        assert_eq!(first.credential.username, ADMIN_USERNAME);
        assert_eq!(first.credential.password.len(), ADMIN_PASSWORD_LEN);

        let second = provisioner.ensure(&id("demo1")).await.unwrap();
        assert!(second.created.is_empty());
        assert_eq!(second.credential, first.credential);
        assert_eq!(cluster.create_count(), 6);
    }

    #[tokio::test]
    async fn test_partial_progress_resumes() {
        let cluster = Arc::new(InMemoryCluster::new());
        let provisioner = provisioner(&cluster);
        cluster.fail_creates(ObjectKind::LimitRange, 1).await;

        let err = provisioner.ensure(&id("demo1")).await.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::TransientInfra {
                step: Step::LimitRange,
                ..
            }
        ));
        assert!(!err.is_terminal());

        let resumed = provisioner.ensure(&id("demo1")).await.unwrap();
        let steps: Vec<Step> = resumed.created.iter().map(|(s, _)| *s).collect();
        assert_eq!(
            steps,
            vec![
                Step::LimitRange,
                Step::NetworkPolicy,
                Step::NetworkPolicy,
                Step::AdminSecret,
            ]
        );
        assert_eq!(cluster.objects_in("store-demo1").await.len(), 5);
    }

    #[tokio::test]
    async fn test_existing_secret_is_never_overwritten() {
        let cluster = Arc::new(InMemoryCluster::new());
        let provisioner = provisioner(&cluster);
        provisioner.ensure(&id("demo1")).await.unwrap();

        let key = ObjectKey::namespaced(ObjectKind::Secret, "store-demo1", "store-admin");
        cluster
            .insert(ClusterObject::new(key.clone()).with_body(json!({
                "stringData": {"username": "owner", "password": "kept-password"}
            })))
            .await;

        let report = provisioner.ensure(&id("demo1")).await.unwrap();
        assert_eq!(report.credential.username, "owner");
        assert_eq!(report.credential.password, "kept-password");
        assert!(report.created.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_secret_is_terminal() {
        let cluster = Arc::new(InMemoryCluster::new());
        let provisioner = provisioner(&cluster);
        provisioner.ensure(&id("demo1")).await.unwrap();

        let key = ObjectKey::namespaced(ObjectKind::Secret, "store-demo1", "store-admin");
        cluster
            .insert(ClusterObject::new(key).with_body(json!({"data": {"username": "!!"}})))
            .await;

        let err = provisioner.ensure(&id("demo1")).await.unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidCredential(_)));
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_foreign_namespace_is_refused() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster
            .insert(ClusterObject::new(ObjectKey::namespace("store-demo1")).with_label("team", "other"))
            .await;

        let err = provisioner(&cluster).ensure(&id("demo1")).await.unwrap_err();
        assert!(matches!(err, ReconcileError::NamespaceOwnership(_)));
        assert_eq!(cluster.create_count(), 0);
    }

    #[tokio::test]
    async fn test_terminating_namespace_is_transient() {
        let cluster = Arc::new(InMemoryCluster::new().with_slow_namespace_deletion());
        let provisioner = provisioner(&cluster);
        provisioner.ensure(&id("demo1")).await.unwrap();
        cluster.delete(&ObjectKey::namespace("store-demo1")).await.unwrap();

        let err = provisioner.ensure(&id("demo1")).await.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::TransientInfra {
                step: Step::Namespace,
                ..
            }
        ));
    }

    #[test]
    fn test_credential_debug_redacts_password() {
        let credential = AdminCredential::generate();
        let rendered = format!("{credential:?}");
        assert!(!rendered.contains(&credential.password));
    }
}
