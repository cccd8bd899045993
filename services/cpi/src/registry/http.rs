//! HTTP registry client.
//!
//! Talks to a registry exposing `{endpoint}/instances/{id}/settings`:
//! - `PUT` stores the settings document
//! - `GET` returns `{"settings": "<json string>", "status": "ok"}`
//! - `DELETE` removes it

use std::time::Duration;

use async_trait::async_trait;
use cpi_id::InstanceId;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, error};

use super::{Registry, RegistryError};
use crate::settings::AgentSettings;

#[derive(Debug, Deserialize)]
struct SettingsResponse {
    settings: String,
    #[serde(default)]
    status: Option<String>,
}

/// Registry client over HTTP with basic auth.
pub struct HttpRegistry {
    client: reqwest::Client,
    endpoint: String,
    user: String,
    password: String,
}

impl HttpRegistry {
    pub fn new(
        endpoint: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            user: user.into(),
            password: password.into(),
        })
    }

    fn settings_url(&self, vm: &InstanceId) -> String {
        format!("{}/instances/{}/settings", self.endpoint, vm)
    }

    async fn check(
        response: reqwest::Response,
        vm: &InstanceId,
    ) -> Result<reqwest::Response, RegistryError> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(RegistryError::NotFound(vm.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(vm_id = %vm, status = %status, body = %body, "Registry request failed");
            return Err(RegistryError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn update_settings(
        &self,
        vm: &InstanceId,
        settings: &AgentSettings,
    ) -> Result<(), RegistryError> {
        let url = self.settings_url(vm);
        debug!(url = %url, "Updating registry settings");

        let response = self
            .client
            .put(&url)
            .basic_auth(&self.user, Some(&self.password))
            .json(settings)
            .send()
            .await?;

        Self::check(response, vm).await?;
        Ok(())
    }

    async fn read_settings(&self, vm: &InstanceId) -> Result<AgentSettings, RegistryError> {
        let url = self.settings_url(vm);
        debug!(url = %url, "Reading registry settings");

        let response = self
            .client
            .get(&url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?;

        let body: SettingsResponse = Self::check(response, vm).await?.json().await?;
        if let Some(status) = body.status.as_deref().filter(|s| *s != "ok") {
            return Err(RegistryError::Status {
                status: StatusCode::OK.as_u16(),
                body: format!("unexpected registry status '{status}'"),
            });
        }
        Ok(serde_json::from_str(&body.settings)?)
    }

    async fn delete_settings(&self, vm: &InstanceId) -> Result<(), RegistryError> {
        let url = self.settings_url(vm);
        debug!(url = %url, "Deleting registry settings");

        let response = self
            .client
            .delete(&url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?;

        match Self::check(response, vm).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }
}
