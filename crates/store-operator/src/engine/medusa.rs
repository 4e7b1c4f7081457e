// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Medusa placeholder.
//!
//! Registered so the engine name is recognised, but every store fails
//! preflight before any resource is touched.

use async_trait::async_trait;

use super::*;

/// Engine name.
pub const ENGINE_NAME: &str = "medusa";

/// Stub handler that rejects every store.
pub struct MedusaEngine {
    settings: EngineSettings,
}

impl MedusaEngine {
    /// Create the handler.
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    fn unsupported(&self) -> EngineError {
        EngineError::Unsupported {
            engine: ENGINE_NAME.to_string(),
            reason: format!(
                "provisioning is not implemented (chart {} is not wired up)",
                self.settings.medusa_chart
            ),
        }
    }
}

#[async_trait]
impl EngineHandler for MedusaEngine {
    fn name(&self) -> &'static str {
        ENGINE_NAME
    }

    fn preflight(&self, _spec: &StoreSpec) -> Result<(), EngineError> {
        Err(self.unsupported())
    }

    async fn install_or_upgrade(&self, _ctx: InstallContext<'_>) -> Result<ReleaseHandle, EngineError> {
        Err(self.unsupported())
    }

    async fn uninstall(&self, _store_id: &StoreId, _namespace: &str) -> Result<UninstallOutcome, EngineError> {
        Ok(UninstallOutcome::NotFound)
    }

    async fn health_check(&self, _store_id: &StoreId, _namespace: &str) -> Result<bool, EngineError> {
        Ok(false)
    }

    fn derive_url(&self, _store_id: &StoreId) -> Option<String> {
        None
    }
}
