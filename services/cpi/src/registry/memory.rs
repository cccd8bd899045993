//! In-process registry.

use std::collections::HashMap;

use async_trait::async_trait;
use cpi_id::InstanceId;
use tokio::sync::RwLock;
use tracing::debug;

use super::{Registry, RegistryError};
use crate::settings::AgentSettings;

/// Registry kept in memory; used in tests and when no registry endpoint is
/// configured.
#[derive(Default)]
pub struct MemoryRegistry {
    settings: RwLock<HashMap<InstanceId, AgentSettings>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of VMs with stored settings.
    pub async fn len(&self) -> usize {
        self.settings.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.settings.read().await.is_empty()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn update_settings(
        &self,
        vm: &InstanceId,
        settings: &AgentSettings,
    ) -> Result<(), RegistryError> {
        debug!(vm_id = %vm, "Updating settings");
        self.settings
            .write()
            .await
            .insert(vm.clone(), settings.clone());
        Ok(())
    }

    async fn read_settings(&self, vm: &InstanceId) -> Result<AgentSettings, RegistryError> {
        self.settings
            .read()
            .await
            .get(vm)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(vm.to_string()))
    }

    async fn delete_settings(&self, vm: &InstanceId) -> Result<(), RegistryError> {
        debug!(vm_id = %vm, "Deleting settings");
        self.settings.write().await.remove(vm);
        Ok(())
    }
}
