// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster client backed by the Kubernetes API.

use async_trait::async_trait;
use kube::Client;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::discovery::ApiResource;
use tracing::debug;

use super::{
    ClusterClient, ClusterError, ClusterObject, CreateOutcome, DeleteOutcome, ObjectKey,
    ObjectKind,
};

/// [`ClusterClient`] using `DynamicObject` APIs.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Wrap an existing client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the in-cluster or kubeconfig environment.
    pub async fn try_default() -> Result<Self, ClusterError> {
        let client = Client::try_default()
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;
        Ok(Self::new(client))
    }

    fn api(&self, kind: ObjectKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = api_resource(kind);
        match namespace {
            Some(ns) if kind.is_namespaced() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }
}

fn api_resource(kind: ObjectKind) -> ApiResource {
    ApiResource {
        group: kind.group().to_string(),
        version: kind.version().to_string(),
        api_version: kind.api_version().to_string(),
        kind: kind.kind().to_string(),
        plural: kind.plural().to_string(),
    }
}

fn map_err(key: &ObjectKey, err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(ae) => ClusterError::Api {
            key: key.to_string(),
            code: ae.code,
            message: ae.message,
        },
        other => ClusterError::Transport(other.to_string()),
    }
}

fn from_dynamic(kind: ObjectKind, obj: DynamicObject) -> ClusterObject {
    let name = obj.metadata.name.clone().unwrap_or_default();
    let key = ObjectKey {
        kind,
        namespace: obj.metadata.namespace.clone(),
        name,
    };
    let phase_terminating = obj
        .data
        .get("status")
        .and_then(|s| s.get("phase"))
        .and_then(|p| p.as_str())
        == Some("Terminating");

    ClusterObject {
        key,
        labels: obj.metadata.labels.clone().unwrap_or_default(),
        terminating: obj.metadata.deletion_timestamp.is_some() || phase_terminating,
        body: obj.data,
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ClusterObject>, ClusterError> {
        let api = self.api(key.kind, key.namespace.as_deref());
        match api.get_opt(&key.name).await {
            Ok(obj) => Ok(obj.map(|o| from_dynamic(key.kind, o))),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(map_err(key, e)),
        }
    }

    async fn create(&self, object: &ClusterObject) -> Result<CreateOutcome, ClusterError> {
        let key = &object.key;
        let api = self.api(key.kind, key.namespace.as_deref());
        let obj: DynamicObject = serde_json::from_value(object.to_manifest())?;

        match api.create(&PostParams::default(), &obj).await {
            Ok(_) => {
                debug!(object = %key, "Created cluster object");
                Ok(CreateOutcome::Created)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(map_err(key, e)),
        }
    }

    async fn delete(&self, key: &ObjectKey) -> Result<DeleteOutcome, ClusterError> {
        let api = self.api(key.kind, key.namespace.as_deref());
        match api.delete(&key.name, &DeleteParams::background()).await {
            Ok(_) => {
                debug!(object = %key, "Deleted cluster object");
                Ok(DeleteOutcome::Deleted)
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(DeleteOutcome::NotFound),
            Err(e) => Err(map_err(key, e)),
        }
    }

    async fn list(
        &self,
        kind: ObjectKind,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<ClusterObject>, ClusterError> {
        let api = self.api(kind, namespace);
        let params = ListParams::default().labels(label_selector);
        let list = api.list(&params).await.map_err(|e| {
            let key = ObjectKey {
                kind,
                namespace: namespace.map(str::to_string),
                name: label_selector.to_string(),
            };
            map_err(&key, e)
        })?;
        Ok(list
            .items
            .into_iter()
            .map(|o| from_dynamic(kind, o))
            .collect())
    }
}
