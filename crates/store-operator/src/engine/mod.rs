// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine handlers.
//!
//! Each supported storefront stack is an [`EngineHandler`] registered under
//! its engine name. The reconciler resolves the handler from the record's
//! `engine` field and only ever calls through the trait; adding an engine
//! means registering another handler.

pub mod medusa;
pub mod woocommerce;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::EngineSettings;
use crate::guardrails::AdminCredential;
use crate::release::{ReleaseError, ReleaseHandle, ReleaseInstaller, UninstallOutcome};
use crate::store::{StoreId, StoreSpec};

pub use medusa::MedusaEngine;
pub use woocommerce::WooCommerceEngine;

/// Errors from engine handlers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The engine cannot provision stores.
    #[error("engine '{engine}' is not supported: {reason}")]
    Unsupported {
        /// Engine name.
        engine: String,
        /// Why it is unsupported.
        reason: String,
    },

    /// The release operation failed.
    #[error(transparent)]
    Release(#[from] ReleaseError),
}

/// Everything a handler needs to install a store's workload.
#[derive(Debug, Clone, Copy)]
pub struct InstallContext<'a> {
    /// Desired spec.
    pub spec: &'a StoreSpec,
    /// Namespace the release goes into.
    pub namespace: &'a str,
    /// Admin credential from the store's secret.
    pub credential: &'a AdminCredential,
}

/// Per-engine install, health and URL strategy.
#[async_trait]
pub trait EngineHandler: Send + Sync {
    /// Engine name as used in store specs.
    fn name(&self) -> &'static str;

    /// Reject specs this engine cannot provision. Runs before any side effect.
    fn preflight(&self, spec: &StoreSpec) -> Result<(), EngineError>;

    /// Release name for a store.
    fn release_name(&self, store_id: &StoreId) -> String {
        format!("{}-{}", self.name(), store_id)
    }

    /// Install or upgrade the store's release.
    async fn install_or_upgrade(&self, ctx: InstallContext<'_>) -> Result<ReleaseHandle, EngineError>;

    /// Remove the store's release; absence is success.
    async fn uninstall(&self, store_id: &StoreId, namespace: &str) -> Result<UninstallOutcome, EngineError>;

    /// Whether the store's workload is ready to serve.
    async fn health_check(&self, store_id: &StoreId, namespace: &str) -> Result<bool, EngineError>;

    /// Public URL of the store.
    fn derive_url(&self, store_id: &StoreId) -> Option<String>;
}

/// Engine name to handler mapping.
#[derive(Clone, Default)]
pub struct EngineRegistry {
    handlers: HashMap<String, Arc<dyn EngineHandler>>,
}

impl EngineRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in engines.
    pub fn with_defaults(settings: EngineSettings, installer: Arc<dyn ReleaseInstaller>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(WooCommerceEngine::new(settings.clone(), installer)));
        registry.register(Arc::new(MedusaEngine::new(settings)));
        registry
    }

    /// Add or replace a handler under its own name.
    pub fn register(&mut self, handler: Arc<dyn EngineHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    /// Handler for an engine name.
    pub fn get(&self, engine: &str) -> Option<Arc<dyn EngineHandler>> {
        self.handlers.get(engine).cloned()
    }

    /// Registered engine names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Store host: `<storeId>.<base domain>`.
pub fn store_host(settings: &EngineSettings, store_id: &StoreId) -> String {
    format!("{}.{}", store_id, settings.base_domain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::MockInstaller;

    #[test]
    fn test_defaults_register_builtin_engines() {
        let registry =
            EngineRegistry::with_defaults(EngineSettings::default(), Arc::new(MockInstaller::new()));
        assert_eq!(registry.names(), vec!["medusa", "woocommerce"]);
        assert!(registry.get("magento").is_none());
    }

    #[test]
    fn test_release_name_is_engine_prefixed() {
        let registry =
            EngineRegistry::with_defaults(EngineSettings::default(), Arc::new(MockInstaller::new()));
        let handler = registry.get("woocommerce").unwrap();
        let id = StoreId::parse("demo1").unwrap();
        assert_eq!(handler.release_name(&id), "woocommerce-demo1");
    }
}
