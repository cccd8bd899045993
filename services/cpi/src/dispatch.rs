//! Command boundary.
//!
//! A [`Request`] names a method and carries positional JSON arguments. The
//! [`Cpi`] decodes them, calls the matching manager and wraps the outcome in
//! a [`Response`] together with the log lines emitted while handling it.

use std::error::Error as _;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::instrument::WithSubscriber;
use tracing::{error, info, info_span, Instrument};

use cpi_id::{InstanceId, SnapshotId, VolumeId};

use crate::cloud::ComputeApi;
use crate::config::Config;
use crate::context::{CloudContext, RequestContext};
use crate::disk::DiskManager;
use crate::error::{CpiError, CpiResult, ErrorType};
use crate::logging::{self, LogBuffer};
use crate::metadata::Metadata;
use crate::properties::{self, DiskCloudProperties, StemcellProperties, VmCloudProperties};
use crate::registry::Registry;
use crate::sizing;
use crate::stemcell::{Stemcell, StemcellManager};
use crate::vm::VmManager;

/// Stemcell formats accepted by `create_stemcell`.
pub const STEMCELL_FORMATS: &[&str] = &["aws-raw", "aws-light"];

/// Highest contract version this CPI speaks.
pub const API_VERSION: u32 = 2;

/// A single orchestrator command.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
    #[serde(default)]
    pub context: RequestEnvelope,
    #[serde(default)]
    pub api_version: Option<u32>,
}

impl Request {
    pub fn new(method: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            arguments,
            context: RequestEnvelope::default(),
            api_version: None,
        }
    }

    pub fn with_api_version(mut self, version: u32) -> Self {
        self.api_version = Some(version);
        self
    }

    pub fn with_director_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.context.request.director_uuid = Some(uuid.into());
        self
    }
}

/// The request `context` object: known fields plus whatever else the
/// orchestrator sends.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestEnvelope {
    #[serde(flatten)]
    pub request: RequestContext,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Error half of a [`Response`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    #[serde(rename = "type")]
    pub error_type: ErrorType,
    pub message: String,
    pub ok_to_retry: bool,
}

impl From<&CpiError> for ResponseError {
    fn from(err: &CpiError) -> Self {
        Self {
            error_type: err.error_type(),
            message: err.to_string(),
            ok_to_retry: err.ok_to_retry(),
        }
    }
}

/// Result envelope. Field order is part of the wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub result: Value,
    pub error: Option<ResponseError>,
    pub log: String,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Entry point tying the managers together.
#[derive(Clone)]
pub struct Cpi {
    stemcells: StemcellManager,
    vms: VmManager,
    disks: DiskManager,
    echo_stderr: bool,
}

impl Cpi {
    pub fn new(config: Config, compute: Arc<dyn ComputeApi>, registry: Arc<dyn Registry>) -> Self {
        let ctx = Arc::new(CloudContext::new(config, compute, registry));
        Self {
            stemcells: StemcellManager::new(ctx.clone()),
            vms: VmManager::new(ctx.clone()),
            disks: DiskManager::new(ctx),
            echo_stderr: false,
        }
    }

    /// Also copy request logs to stderr.
    pub fn with_stderr_echo(mut self) -> Self {
        self.echo_stderr = true;
        self
    }

    /// Handle one request. Never fails; errors are reported in the response.
    pub async fn dispatch(&self, request: Request) -> Response {
        let buffer = LogBuffer::new();
        let subscriber = logging::request_dispatch(&buffer, self.echo_stderr);

        let span = tracing::dispatcher::with_default(&subscriber, || {
            info_span!(
                "request",
                method = %request.method,
                request_id = request.context.request.request_id.as_deref().unwrap_or("-"),
            )
        });
        let outcome = self
            .handle(&request)
            .instrument(span)
            .with_subscriber(subscriber)
            .await;

        match outcome {
            Ok(result) => Response {
                result,
                error: None,
                log: buffer.contents(),
            },
            Err(err) => Response {
                result: Value::Null,
                error: Some(ResponseError::from(&err)),
                log: buffer.contents(),
            },
        }
    }

    async fn handle(&self, request: &Request) -> CpiResult<Value> {
        info!(arguments = request.arguments.len(), "Handling request");
        let result = self.call(request).await;
        if let Err(err) = &result {
            error!(
                error_type = ?err.error_type(),
                ok_to_retry = err.ok_to_retry(),
                "{}",
                error_chain(err)
            );
        }
        result
    }

    async fn call(&self, request: &Request) -> CpiResult<Value> {
        let args = Args(&request.arguments);
        let ctx = &request.context.request;
        let v2 = request.api_version.unwrap_or(1) >= 2;

        match request.method.as_str() {
            "info" => Ok(json!({
                "stemcell_formats": STEMCELL_FORMATS,
                "api_version": API_VERSION,
            })),

            "create_stemcell" => {
                let image_path: String = args.get(0, "image_path")?;
                let props: StemcellProperties =
                    properties::parse("stemcell", args.raw(1))?;
                let stemcell = self.stemcells.create_stemcell(&image_path, &props).await?;
                Ok(json!(stemcell.to_string()))
            }
            "delete_stemcell" => {
                let stemcell: Stemcell = args.get(0, "stemcell_cid")?;
                self.stemcells.delete_stemcell(&stemcell).await?;
                Ok(Value::Null)
            }

            "create_vm" => {
                let agent_id: String = args.get(0, "agent_id")?;
                let stemcell: Stemcell = args.get(1, "stemcell_cid")?;
                let props: VmCloudProperties = properties::parse("VM", args.raw(2))?;
                let networks = args.raw(3).clone();
                let disks: Option<Vec<VolumeId>> = args.get(4, "disk_cids")?;
                let env = args.raw(5).clone();

                let created = self
                    .vms
                    .create_vm(
                        &agent_id,
                        &stemcell,
                        &props,
                        &networks,
                        disks.as_deref().unwrap_or_default(),
                        &env,
                        ctx,
                    )
                    .await?;
                if v2 {
                    Ok(json!([created.vm_id, created.networks]))
                } else {
                    Ok(json!(created.vm_id))
                }
            }
            "delete_vm" => {
                let vm: InstanceId = args.get(0, "vm_cid")?;
                self.vms.delete_vm(&vm).await?;
                Ok(Value::Null)
            }
            "has_vm" => {
                let vm: InstanceId = args.get(0, "vm_cid")?;
                Ok(json!(self.vms.has_vm(&vm).await?))
            }
            "reboot_vm" => {
                let vm: InstanceId = args.get(0, "vm_cid")?;
                self.vms.reboot_vm(&vm).await?;
                Ok(Value::Null)
            }
            "set_vm_metadata" => {
                let vm: InstanceId = args.get(0, "vm_cid")?;
                let metadata: Metadata = args.get(1, "metadata")?;
                self.vms.set_vm_metadata(&vm, &metadata).await?;
                Ok(Value::Null)
            }
            "calculate_vm_cloud_properties" => {
                let sized = sizing::calculate_vm_cloud_properties(args.raw(0))?;
                serde_json::to_value(sized).map_err(|e| CpiError::cloud(e.to_string()))
            }
            "get_disks" => {
                let vm: InstanceId = args.get(0, "vm_cid")?;
                Ok(json!(self.vms.get_disks(&vm).await?))
            }

            "create_disk" => {
                let size: u64 = args.get(0, "size")?;
                let props: DiskCloudProperties = properties::parse("disk", args.raw(1))?;
                let vm: Option<InstanceId> = args.get(2, "vm_cid")?;
                let disk = self.disks.create_disk(size, &props, vm.as_ref()).await?;
                Ok(json!(disk))
            }
            "delete_disk" => {
                let disk: VolumeId = args.get(0, "disk_cid")?;
                self.disks.delete_disk(&disk).await?;
                Ok(Value::Null)
            }
            "attach_disk" => {
                let vm: InstanceId = args.get(0, "vm_cid")?;
                let disk: VolumeId = args.get(1, "disk_cid")?;
                let device = self.disks.attach_disk(&vm, &disk).await?;
                Ok(if v2 { json!(device) } else { Value::Null })
            }
            "detach_disk" => {
                let vm: InstanceId = args.get(0, "vm_cid")?;
                let disk: VolumeId = args.get(1, "disk_cid")?;
                self.disks.detach_disk(&vm, &disk).await?;
                Ok(Value::Null)
            }
            "has_disk" => {
                let disk: VolumeId = args.get(0, "disk_cid")?;
                Ok(json!(self.disks.has_disk(&disk).await?))
            }
            "resize_disk" => {
                let disk: VolumeId = args.get(0, "disk_cid")?;
                let size: u64 = args.get(1, "new_size")?;
                self.disks.resize_disk(&disk, size).await?;
                Ok(Value::Null)
            }
            "set_disk_metadata" => {
                let disk: VolumeId = args.get(0, "disk_cid")?;
                let metadata: Metadata = args.get(1, "metadata")?;
                self.disks.set_disk_metadata(&disk, &metadata).await?;
                Ok(Value::Null)
            }
            "snapshot_disk" => {
                let disk: VolumeId = args.get(0, "disk_cid")?;
                let metadata: Option<Metadata> = args.get(1, "metadata")?;
                let snapshot = self
                    .disks
                    .snapshot_disk(&disk, &metadata.unwrap_or_default(), ctx)
                    .await?;
                Ok(json!(snapshot))
            }
            "delete_snapshot" => {
                let snapshot: SnapshotId = args.get(0, "snapshot_cid")?;
                self.disks.delete_snapshot(&snapshot).await?;
                Ok(Value::Null)
            }

            other => Err(CpiError::validation(format!("Invalid Method: {other}"))),
        }
    }
}

/// Positional request arguments.
struct Args<'a>(&'a [Value]);

impl Args<'_> {
    fn raw(&self, index: usize) -> &Value {
        self.0.get(index).unwrap_or(&Value::Null)
    }

    fn get<T: DeserializeOwned>(&self, index: usize, name: &str) -> CpiResult<T> {
        T::deserialize(self.raw(index))
            .map_err(|e| CpiError::validation(format!("Invalid argument '{name}': {e}")))
    }
}

/// `err` followed by each of its sources.
fn error_chain(err: &CpiError) -> String {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}
