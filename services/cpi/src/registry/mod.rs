//! Settings registry collaborator.
//!
//! Agents read their settings document from the registry at boot. The CPI
//! writes it on VM creation and updates it when persistent disks move.

mod http;
mod memory;

use async_trait::async_trait;
use cpi_id::InstanceId;
use thiserror::Error;

use crate::settings::AgentSettings;

pub use http::HttpRegistry;
pub use memory::MemoryRegistry;

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("settings for {0} not found")]
    NotFound(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("registry returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid settings document: {0}")]
    Json(#[from] serde_json::Error),
}

impl RegistryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound(_))
    }
}

/// Settings registry.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Create or replace the settings for `vm`.
    async fn update_settings(
        &self,
        vm: &InstanceId,
        settings: &AgentSettings,
    ) -> Result<(), RegistryError>;

    async fn read_settings(&self, vm: &InstanceId) -> Result<AgentSettings, RegistryError>;

    /// Remove the settings for `vm`. Missing settings are not an error.
    async fn delete_settings(&self, vm: &InstanceId) -> Result<(), RegistryError>;
}
