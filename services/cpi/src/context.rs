//! Shared state for the lifecycle managers.

use std::future::Future;
use std::sync::Arc;

use cpi_id::{InstanceId, VolumeId};
use cpi_retry::{with_retry, RetryPolicy};
use serde::Deserialize;

use crate::cloud::{
    ApiResult, CloudApiError, CloudErrorKind, ComputeApi, Instance, InstanceState, Volume,
};
use crate::config::Config;
use crate::error::{CpiError, CpiResult};
use crate::registry::Registry;

/// Per-request context sent by the orchestrator.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestContext {
    #[serde(default)]
    pub director_uuid: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Collaborators and settings shared by every manager.
pub struct CloudContext {
    pub compute: Arc<dyn ComputeApi>,
    pub registry: Arc<dyn Registry>,
    pub config: Config,
    pub retry: RetryPolicy,
}

impl CloudContext {
    pub fn new(config: Config, compute: Arc<dyn ComputeApi>, registry: Arc<dyn Registry>) -> Self {
        let retry = config.cloud.retry.policy();
        Self {
            compute,
            registry,
            config,
            retry,
        }
    }

    /// Run a remote call, retrying transient failures.
    pub async fn retry<T, F, Fut>(&self, operation: &str, op: F) -> ApiResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        with_retry(&self.retry, operation, CloudApiError::is_transient, op).await
    }

    /// Retry only on throttling, for calls that are not idempotent.
    pub async fn retry_throttled<T, F, Fut>(&self, operation: &str, op: F) -> ApiResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        with_retry(
            &self.retry,
            operation,
            |e: &CloudApiError| e.kind == CloudErrorKind::Throttled,
            op,
        )
        .await
    }

    /// Describe an instance that has not been terminated.
    pub async fn live_instance(&self, id: &InstanceId) -> CpiResult<Option<Instance>> {
        let instance = self
            .retry("describe_instance", || self.compute.describe_instance(id))
            .await?;
        Ok(instance.filter(|i| i.state != InstanceState::Terminated))
    }

    /// Like [`live_instance`](Self::live_instance), but absence is `VMNotFound`.
    pub async fn require_instance(&self, id: &InstanceId) -> CpiResult<Instance> {
        self.live_instance(id)
            .await?
            .ok_or_else(|| CpiError::VmNotFound(id.to_string()))
    }

    pub async fn describe_volume(&self, id: &VolumeId) -> CpiResult<Option<Volume>> {
        Ok(self
            .retry("describe_volume", || self.compute.describe_volume(id))
            .await?)
    }

    /// Like [`describe_volume`](Self::describe_volume), but absence is
    /// `DiskNotFound`.
    pub async fn require_volume(&self, id: &VolumeId) -> CpiResult<Volume> {
        self.describe_volume(id)
            .await?
            .ok_or_else(|| CpiError::DiskNotFound(id.to_string()))
    }
}
