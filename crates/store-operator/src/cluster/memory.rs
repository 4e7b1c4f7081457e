// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory cluster for tests and local runs.
//!
//! Behaves like an API server for the subset the controller uses: creates
//! are first-writer-wins, Secret `stringData` is folded into base64 `data`,
//! and deleting a namespace removes everything inside it. Namespace
//! deletion can be made slow to exercise terminating namespaces, and
//! failures can be injected per kind.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::Mutex;

use super::*;

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, ClusterObject>,
    fail_creates: HashMap<ObjectKind, u32>,
    fail_gets: HashMap<ObjectKind, u32>,
}

/// In-memory [`ClusterClient`].
#[derive(Default)]
pub struct InMemoryCluster {
    state: Arc<Mutex<State>>,
    slow_namespace_deletion: bool,
    creates: AtomicU64,
    deletes: AtomicU64,
}

impl InMemoryCluster {
    /// Empty cluster with instant namespace deletion.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep deleted namespaces in a terminating state until
    /// [`finish_namespace_deletions`](Self::finish_namespace_deletions).
    pub fn with_slow_namespace_deletion(mut self) -> Self {
        self.slow_namespace_deletion = true;
        self
    }

    /// Fail the next `times` creates of `kind` with a 503.
    pub async fn fail_creates(&self, kind: ObjectKind, times: u32) {
        self.state.lock().await.fail_creates.insert(kind, times);
    }

    /// Fail the next `times` gets of `kind` with a 503.
    pub async fn fail_gets(&self, kind: ObjectKind, times: u32) {
        self.state.lock().await.fail_gets.insert(kind, times);
    }

    /// Store an object verbatim, replacing any existing one.
    pub async fn insert(&self, object: ClusterObject) {
        let object = normalize(object);
        self.state
            .lock()
            .await
            .objects
            .insert(object.key.clone(), object);
    }

    /// Remove all terminating namespaces and their contents.
    pub async fn finish_namespace_deletions(&self) {
        let mut state = self.state.lock().await;
        let terminating: Vec<String> = state
            .objects
            .values()
            .filter(|o| o.key.kind == ObjectKind::Namespace && o.terminating)
            .map(|o| o.key.name.clone())
            .collect();
        for ns in terminating {
            purge_namespace(&mut state.objects, &ns);
        }
    }

    /// Snapshot of an object.
    pub async fn object(&self, key: &ObjectKey) -> Option<ClusterObject> {
        self.state.lock().await.objects.get(key).cloned()
    }

    /// Whether an object exists.
    pub async fn contains(&self, key: &ObjectKey) -> bool {
        self.state.lock().await.objects.contains_key(key)
    }

    /// Keys of all objects in a namespace.
    pub async fn objects_in(&self, namespace: &str) -> Vec<ObjectKey> {
        self.state
            .lock()
            .await
            .objects
            .keys()
            .filter(|k| k.namespace.as_deref() == Some(namespace))
            .cloned()
            .collect()
    }

    /// Names of all namespaces.
    pub async fn namespaces(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .objects
            .keys()
            .filter(|k| k.kind == ObjectKind::Namespace)
            .map(|k| k.name.clone())
            .collect()
    }

    /// Number of successful creates.
    pub fn create_count(&self) -> u64 {
        self.creates.load(Ordering::SeqCst)
    }

    /// Number of accepted deletes.
    pub fn delete_count(&self) -> u64 {
        self.deletes.load(Ordering::SeqCst)
    }
}

fn unavailable(key: &ObjectKey) -> ClusterError {
    ClusterError::Api {
        key: key.to_string(),
        code: 503,
        message: "injected failure".to_string(),
    }
}

fn take_failure(counters: &mut HashMap<ObjectKind, u32>, kind: ObjectKind) -> bool {
    match counters.get_mut(&kind) {
        Some(n) if *n > 0 => {
            *n -= 1;
            true
        }
        _ => false,
    }
}

/// Fold Secret `stringData` into base64 `data`, as the API server does.
fn normalize(mut object: ClusterObject) -> ClusterObject {
    if object.key.kind != ObjectKind::Secret {
        return object;
    }
    let Some(body) = object.body.as_object_mut() else {
        return object;
    };
    if let Some(serde_json::Value::Object(string_data)) = body.remove("stringData") {
        let data = body
            .entry("data")
            .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
        if let Some(data) = data.as_object_mut() {
            for (k, v) in string_data {
                let raw = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
                data.insert(k, serde_json::Value::String(BASE64.encode(raw)));
            }
        }
    }
    object
}

fn purge_namespace(objects: &mut BTreeMap<ObjectKey, ClusterObject>, ns: &str) {
    objects.retain(|key, _| {
        key.namespace.as_deref() != Some(ns)
            && !(key.kind == ObjectKind::Namespace && key.name == ns)
    });
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ClusterObject>, ClusterError> {
        let mut state = self.state.lock().await;
        if take_failure(&mut state.fail_gets, key.kind) {
            return Err(unavailable(key));
        }
        Ok(state.objects.get(key).cloned())
    }

    async fn create(&self, object: &ClusterObject) -> Result<CreateOutcome, ClusterError> {
        let key = &object.key;
        let mut state = self.state.lock().await;
        if take_failure(&mut state.fail_creates, key.kind) {
            return Err(unavailable(key));
        }
        if state.objects.contains_key(key) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        if let Some(ns) = &key.namespace {
            match state.objects.get(&ObjectKey::namespace(ns.clone())) {
                None => {
                    return Err(ClusterError::Api {
                        key: key.to_string(),
                        code: 404,
                        message: format!("namespaces \"{ns}\" not found"),
                    });
                }
                Some(owner) if owner.terminating => {
                    return Err(ClusterError::Api {
                        key: key.to_string(),
                        code: 403,
                        message: format!("namespace {ns} is being terminated"),
                    });
                }
                Some(_) => {}
            }
        }
        let mut stored = normalize(object.clone());
        stored.terminating = false;
        state.objects.insert(key.clone(), stored);
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(CreateOutcome::Created)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<DeleteOutcome, ClusterError> {
        let mut state = self.state.lock().await;
        if !state.objects.contains_key(key) {
            return Ok(DeleteOutcome::NotFound);
        }
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if key.kind == ObjectKind::Namespace {
            if self.slow_namespace_deletion {
                if let Some(ns) = state.objects.get_mut(key) {
                    ns.terminating = true;
                }
            } else {
                purge_namespace(&mut state.objects, &key.name);
            }
        } else {
            state.objects.remove(key);
        }
        Ok(DeleteOutcome::Deleted)
    }

    async fn list(
        &self,
        kind: ObjectKind,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<ClusterObject>, ClusterError> {
        let terms = parse_selector(label_selector);
        let state = self.state.lock().await;
        Ok(state
            .objects
            .values()
            .filter(|o| o.key.kind == kind)
            .filter(|o| namespace.is_none() || o.key.namespace.as_deref() == namespace)
            .filter(|o| {
                terms.iter().all(|(k, v)| match v {
                    Some(v) => o.label(k) == Some(v.as_str()),
                    None => o.labels.contains_key(k),
                })
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_is_first_writer_wins() {
        let cluster = InMemoryCluster::new();
        let ns = ClusterObject::new(ObjectKey::namespace("store-demo1")).with_label("a", "1");
        assert_eq!(cluster.create(&ns).await.unwrap(), CreateOutcome::Created);

        let other = ClusterObject::new(ObjectKey::namespace("store-demo1")).with_label("a", "2");
        assert_eq!(cluster.create(&other).await.unwrap(), CreateOutcome::AlreadyExists);

        let stored = cluster.get(&ns.key).await.unwrap().unwrap();
        assert_eq!(stored.label("a"), Some("1"));
        assert_eq!(cluster.create_count(), 1);
    }

    #[tokio::test]
    async fn test_secret_string_data_is_encoded() {
        let cluster = InMemoryCluster::new();
        cluster
            .create(&ClusterObject::new(ObjectKey::namespace("ns1")))
            .await
            .unwrap();
        let key = ObjectKey::namespaced(ObjectKind::Secret, "ns1", "admin");
        let secret = ClusterObject::new(key.clone())
            .with_body(json!({"type": "Opaque", "stringData": {"password": "s3cret"}}));
        cluster.create(&secret).await.unwrap();

        let stored = cluster.get(&key).await.unwrap().unwrap();
        assert!(stored.body.get("stringData").is_none());
        assert_eq!(stored.body["data"]["password"], BASE64.encode("s3cret"));
    }

    #[tokio::test]
    async fn test_create_in_missing_namespace_fails() {
        let cluster = InMemoryCluster::new();
        let key = ObjectKey::namespaced(ObjectKind::LimitRange, "nope", "limits");
        let err = cluster.create(&ClusterObject::new(key)).await.unwrap_err();
        assert!(matches!(err, ClusterError::Api { code: 404, .. }));
    }

    #[tokio::test]
    async fn test_namespace_delete_cascades() {
        let cluster = InMemoryCluster::new();
        cluster
            .create(&ClusterObject::new(ObjectKey::namespace("ns1")))
            .await
            .unwrap();
        let quota = ObjectKey::namespaced(ObjectKind::ResourceQuota, "ns1", "quota");
        cluster.create(&ClusterObject::new(quota.clone())).await.unwrap();

        let outcome = cluster.delete(&ObjectKey::namespace("ns1")).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Deleted);
        assert!(!cluster.contains(&quota).await);
        assert_eq!(
            cluster.delete(&ObjectKey::namespace("ns1")).await.unwrap(),
            DeleteOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_slow_namespace_deletion() {
        let cluster = InMemoryCluster::new().with_slow_namespace_deletion();
        let key = ObjectKey::namespace("ns1");
        cluster.create(&ClusterObject::new(key.clone())).await.unwrap();
        cluster.delete(&key).await.unwrap();

        assert!(cluster.get(&key).await.unwrap().unwrap().terminating);
        cluster.finish_namespace_deletions().await;
        assert!(cluster.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_by_label() {
        let cluster = InMemoryCluster::new();
        for (name, managed) in [("a1", "true"), ("b1", "false")] {
            cluster
                .create(&ClusterObject::new(ObjectKey::namespace(name)).with_label(MANAGED_LABEL, managed))
                .await
                .unwrap();
        }
        let managed = cluster
            .list(ObjectKind::Namespace, None, &format!("{MANAGED_LABEL}=true"))
            .await
            .unwrap();
        assert_eq!(managed.len(), 1);
        assert_eq!(managed[0].key.name, "a1");
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let cluster = InMemoryCluster::new();
        cluster.fail_creates(ObjectKind::Namespace, 1).await;
        let ns = ClusterObject::new(ObjectKey::namespace("ns1"));
        assert!(cluster.create(&ns).await.is_err());
        assert_eq!(cluster.create(&ns).await.unwrap(), CreateOutcome::Created);
    }
}
