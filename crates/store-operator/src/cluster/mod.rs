// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster API seam.
//!
//! The controller only needs get / create / delete / list-by-label on a
//! handful of object kinds, so objects travel as untyped JSON bodies keyed
//! by [`ObjectKey`]. [`KubeCluster`] talks to a real API server;
//! [`InMemoryCluster`] backs tests.

pub mod kube_client;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;

pub use kube_client::KubeCluster;
pub use memory::InMemoryCluster;

/// Label marking namespaces created by the operator.
pub const MANAGED_LABEL: &str = "stores.platform/managed-store";
/// Label carrying the owning store id.
pub const STORE_ID_LABEL: &str = "stores.platform/store-id";

/// Object kinds the controller manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    /// `v1/Namespace`
    Namespace,
    /// `v1/ResourceQuota`
    ResourceQuota,
    /// `v1/LimitRange`
    LimitRange,
    /// `networking.k8s.io/v1/NetworkPolicy`
    NetworkPolicy,
    /// `v1/Secret`
    Secret,
}

impl ObjectKind {
    /// API group, empty for the core group.
    pub fn group(&self) -> &'static str {
        match self {
            ObjectKind::NetworkPolicy => "networking.k8s.io",
            _ => "",
        }
    }

    /// API version without the group.
    pub fn version(&self) -> &'static str {
        "v1"
    }

    /// `apiVersion` field value.
    pub fn api_version(&self) -> &'static str {
        match self {
            ObjectKind::NetworkPolicy => "networking.k8s.io/v1",
            _ => "v1",
        }
    }

    /// `kind` field value.
    pub fn kind(&self) -> &'static str {
        match self {
            ObjectKind::Namespace => "Namespace",
            ObjectKind::ResourceQuota => "ResourceQuota",
            ObjectKind::LimitRange => "LimitRange",
            ObjectKind::NetworkPolicy => "NetworkPolicy",
            ObjectKind::Secret => "Secret",
        }
    }

    /// Resource plural used in API paths.
    pub fn plural(&self) -> &'static str {
        match self {
            ObjectKind::Namespace => "namespaces",
            ObjectKind::ResourceQuota => "resourcequotas",
            ObjectKind::LimitRange => "limitranges",
            ObjectKind::NetworkPolicy => "networkpolicies",
            ObjectKind::Secret => "secrets",
        }
    }

    /// Whether objects of this kind live inside a namespace.
    pub fn is_namespaced(&self) -> bool {
        !matches!(self, ObjectKind::Namespace)
    }
}

/// Identity of a cluster object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Object kind.
    pub kind: ObjectKind,
    /// Namespace, `None` for cluster-scoped kinds.
    pub namespace: Option<String>,
    /// Object name.
    pub name: String,
}

impl ObjectKey {
    /// Key of a namespace.
    pub fn namespace(name: impl Into<String>) -> Self {
        Self {
            kind: ObjectKind::Namespace,
            namespace: None,
            name: name.into(),
        }
    }

    /// Key of a namespaced object.
    pub fn namespaced(kind: ObjectKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind.kind(), ns, self.name),
            None => write!(f, "{}/{}", self.kind.kind(), self.name),
        }
    }
}

/// An untyped cluster object.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterObject {
    /// Identity.
    pub key: ObjectKey,
    /// Metadata labels.
    pub labels: BTreeMap<String, String>,
    /// Top-level fields other than `apiVersion`, `kind` and `metadata`
    /// (`spec`, `data`, `stringData`, `type`, ...).
    pub body: serde_json::Value,
    /// Whether the object is being deleted.
    pub terminating: bool,
}

impl ClusterObject {
    /// New object with an empty body.
    pub fn new(key: ObjectKey) -> Self {
        Self {
            key,
            labels: BTreeMap::new(),
            body: json!({}),
            terminating: false,
        }
    }

    /// Add a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Replace the body.
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = body;
        self
    }

    /// Label value, if set.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// Full manifest including `apiVersion`, `kind` and `metadata`.
    pub fn to_manifest(&self) -> serde_json::Value {
        let mut metadata = json!({
            "name": self.key.name,
            "labels": self.labels,
        });
        if let Some(ns) = &self.key.namespace {
            metadata["namespace"] = json!(ns);
        }
        let mut manifest = json!({
            "apiVersion": self.key.kind.api_version(),
            "kind": self.key.kind.kind(),
            "metadata": metadata,
        });
        if let (Some(target), Some(fields)) = (manifest.as_object_mut(), self.body.as_object()) {
            for (k, v) in fields {
                target.insert(k.clone(), v.clone());
            }
        }
        manifest
    }
}

/// Outcome of a create call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The object was created.
    Created,
    /// An object with the same key already existed; nothing was changed.
    AlreadyExists,
}

/// Outcome of a delete call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Deletion was accepted.
    Deleted,
    /// No such object.
    NotFound,
}

/// Cluster API errors.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The API server rejected the request.
    #[error("API error {code} on {key}: {message}")]
    Api {
        /// Object the request targeted.
        key: String,
        /// HTTP status code.
        code: u16,
        /// Server message.
        message: String,
    },

    /// The request could not be delivered.
    #[error("Transport error: {0}")]
    Transport(String),

    /// An object could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Cluster operations used by the controller.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch an object, `None` when absent.
    async fn get(&self, key: &ObjectKey) -> Result<Option<ClusterObject>, ClusterError>;

    /// Create an object; an existing object is left untouched.
    async fn create(&self, object: &ClusterObject) -> Result<CreateOutcome, ClusterError>;

    /// Delete an object; deleting an absent object is not an error.
    async fn delete(&self, key: &ObjectKey) -> Result<DeleteOutcome, ClusterError>;

    /// List objects of a kind matching a label selector (`k=v,k2=v2`).
    async fn list(
        &self,
        kind: ObjectKind,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<ClusterObject>, ClusterError>;
}

/// Parse a `k=v,k2=v2` selector into pairs. Bare keys match any value.
pub(crate) fn parse_selector(selector: &str) -> Vec<(String, Option<String>)> {
    selector
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|term| match term.split_once('=') {
            Some((k, v)) => (k.trim().to_string(), Some(v.trim().to_string())),
            None => (term.to_string(), None),
        })
        .collect()
}
