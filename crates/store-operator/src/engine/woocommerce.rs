// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! WooCommerce on the WordPress chart.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::*;
use crate::release::{ReleaseRequest, ReleaseStatus};

/// Engine name.
pub const ENGINE_NAME: &str = "woocommerce";

/// Primary engine handler.
pub struct WooCommerceEngine {
    settings: EngineSettings,
    installer: Arc<dyn ReleaseInstaller>,
}

impl WooCommerceEngine {
    /// Create the handler.
    pub fn new(settings: EngineSettings, installer: Arc<dyn ReleaseInstaller>) -> Self {
        Self {
            settings,
            installer,
        }
    }

    fn values(&self, ctx: &InstallContext<'_>) -> BTreeMap<String, Value> {
        let store_id = &ctx.spec.store_id;
        let host = store_host(&self.settings, store_id);

        let mut values = BTreeMap::from([
            ("wordpress.ingress.enabled".to_string(), json!(true)),
            (
                "wordpress.ingress.ingressClassName".to_string(),
                json!(self.settings.ingress_class),
            ),
            ("wordpress.ingress.hostname".to_string(), json!(host)),
            ("wordpress.service.type".to_string(), json!("ClusterIP")),
            (
                "wordpress.wordpressUsername".to_string(),
                json!(ctx.credential.username),
            ),
            (
                "wordpress.wordpressPassword".to_string(),
                json!(ctx.credential.password),
            ),
            (
                "wordpress.wordpressEmail".to_string(),
                json!(format!("admin@{host}")),
            ),
            (
                "wordpress.wordpressBlogName".to_string(),
                json!(store_id.as_str()),
            ),
            ("wordpress.wordpressPlugins".to_string(), json!("woocommerce")),
        ]);

        if let Some(class) = &self.settings.storage_class {
            values.insert(
                "wordpress.persistence.storageClass".to_string(),
                json!(class),
            );
            values.insert(
                "wordpress.mariadb.primary.persistence.storageClass".to_string(),
                json!(class),
            );
        }
        values
    }
}

#[async_trait]
impl EngineHandler for WooCommerceEngine {
    fn name(&self) -> &'static str {
        ENGINE_NAME
    }

    fn preflight(&self, _spec: &StoreSpec) -> Result<(), EngineError> {
        Ok(())
    }

    async fn install_or_upgrade(&self, ctx: InstallContext<'_>) -> Result<ReleaseHandle, EngineError> {
        let request = ReleaseRequest {
            name: self.release_name(&ctx.spec.store_id),
            namespace: ctx.namespace.to_string(),
            chart: self.settings.woocommerce_chart.clone(),
            values: self.values(&ctx),
        };
        Ok(self.installer.install_or_upgrade(&request).await?)
    }

    async fn uninstall(&self, store_id: &StoreId, namespace: &str) -> Result<UninstallOutcome, EngineError> {
        Ok(self
            .installer
            .uninstall(&self.release_name(store_id), namespace)
            .await?)
    }

    async fn health_check(&self, store_id: &StoreId, namespace: &str) -> Result<bool, EngineError> {
        let status = self
            .installer
            .status(&self.release_name(store_id), namespace)
            .await?;
        Ok(matches!(status, Some(info) if info.status == ReleaseStatus::Deployed))
    }

    fn derive_url(&self, store_id: &StoreId) -> Option<String> {
        if self.settings.base_domain.is_empty() {
            return None;
        }
        Some(format!(
            "{}://{}",
            self.settings.url_scheme,
            store_host(&self.settings, store_id)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::MockInstaller;

    fn credential() -> AdminCredential {
        AdminCredential {
            username: "admin".to_string(),
            password: "pw".to_string(),
        }
    }

    #[tokio::test]
    async fn test_install_passes_store_values() {
        let installer = Arc::new(MockInstaller::new().with_delay(0));
        let settings = EngineSettings {
            storage_class: Some("fast".to_string()),
            ..EngineSettings::default()
        };
        let engine = WooCommerceEngine::new(settings, installer.clone());
        let spec = StoreSpec::new(StoreId::parse("demo1").unwrap(), ENGINE_NAME);
        let credential = credential();

        engine
            .install_or_upgrade(InstallContext {
                spec: &spec,
                namespace: "store-demo1",
                credential: &credential,
            })
            .await
            .unwrap();

        let values = installer
            .values_of("woocommerce-demo1", "store-demo1")
            .await
            .unwrap();
        assert_eq!(values["wordpress.ingress.hostname"], "demo1.127.0.0.1.nip.io");
        assert_eq!(values["wordpress.wordpressEmail"], "admin@demo1.127.0.0.1.nip.io");
        assert_eq!(values["wordpress.wordpressPassword"], "pw");
        assert_eq!(values["wordpress.mariadb.primary.persistence.storageClass"], "fast");
        assert!(engine.health_check(&spec.store_id, "store-demo1").await.unwrap());
    }

    #[tokio::test]
    async fn test_health_false_without_release() {
        let engine = WooCommerceEngine::new(EngineSettings::default(), Arc::new(MockInstaller::new()));
        let id = StoreId::parse("demo1").unwrap();
        assert!(!engine.health_check(&id, "store-demo1").await.unwrap());
    }

    #[test]
    fn test_derive_url() {
        let engine = WooCommerceEngine::new(EngineSettings::default(), Arc::new(MockInstaller::new()));
        let id = StoreId::parse("demo1").unwrap();
        assert_eq!(
            engine.derive_url(&id).as_deref(),
            Some("http://demo1.127.0.0.1.nip.io")
        );
    }
}
