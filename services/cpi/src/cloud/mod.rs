//! Remote compute API interface.
//!
//! The orchestrator never talks to a provider SDK directly. Everything it
//! needs (instances, volumes, snapshots, images, networking, load
//! balancers) is expressed by the [`ComputeApi`] trait so that:
//! - a provider binding can be plugged in without touching orchestration
//! - the in-memory [`MemoryCloud`] can stand in for tests and local runs
//!
//! `describe_*` calls return `Ok(None)` for absent resources; every other
//! failure is a [`CloudApiError`] whose [`CloudErrorKind`] drives retry
//! classification.

mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cpi_id::{
    ImageId, InstanceId, RouteTableId, SecurityGroupId, SnapshotId, SubnetId, VolumeId, VpcId,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::{MemoryCloud, SeedImage, SimulatorError};

/// Ordered key/value tag set.
pub type Tags = BTreeMap<String, String>;

// =============================================================================
// Errors
// =============================================================================

/// Classification of remote API failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudErrorKind {
    /// The referenced resource does not exist.
    NotFound,
    /// The resource is busy (e.g. volume still in use after attach).
    InUse,
    /// The resource is mid-transition and rejected the call.
    IncorrectState,
    /// The request was rate limited.
    Throttled,
    /// Credentials were rejected or lack permission.
    AuthFailure,
    /// The request was malformed or referenced an invalid value.
    InvalidParameter,
    /// Anything else.
    Internal,
}

/// Error returned by the remote compute API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct CloudApiError {
    pub kind: CloudErrorKind,
    /// Provider error code, e.g. `VolumeInUse`.
    pub code: String,
    pub message: String,
}

impl CloudApiError {
    pub fn new(kind: CloudErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::NotFound, code, message)
    }

    /// Returns true for failures caused by eventual consistency or rate
    /// limiting, which a later attempt may not hit.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            CloudErrorKind::InUse | CloudErrorKind::IncorrectState | CloudErrorKind::Throttled
        )
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == CloudErrorKind::NotFound
    }
}

/// Result alias for remote API calls.
pub type ApiResult<T> = Result<T, CloudApiError>;

// =============================================================================
// Disks
// =============================================================================

/// Block volume type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskType {
    /// General purpose SSD (current generation).
    #[default]
    Gp3,
    /// General purpose SSD (previous generation).
    Gp2,
    /// Provisioned IOPS SSD.
    Io1,
    /// Provisioned IOPS SSD (current generation).
    Io2,
    /// Magnetic.
    Standard,
    /// Cold HDD.
    Sc1,
    /// Throughput optimized HDD.
    St1,
}

impl DiskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskType::Gp3 => "gp3",
            DiskType::Gp2 => "gp2",
            DiskType::Io1 => "io1",
            DiskType::Io2 => "io2",
            DiskType::Standard => "standard",
            DiskType::Sc1 => "sc1",
            DiskType::St1 => "st1",
        }
    }

    /// Provisioned-IOPS types take a mandatory `iops` value.
    pub fn requires_iops(&self) -> bool {
        matches!(self, DiskType::Io1 | DiskType::Io2)
    }
}

impl fmt::Display for DiskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeState {
    Creating,
    Available,
    InUse,
    Deleting,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentState {
    Attaching,
    Attached,
    Detaching,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeAttachment {
    pub instance_id: InstanceId,
    pub device: String,
    pub state: AttachmentState,
    pub delete_on_termination: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: VolumeId,
    pub size_gib: u64,
    pub volume_type: DiskType,
    pub iops: Option<u32>,
    pub encrypted: bool,
    pub kms_key_id: Option<String>,
    pub availability_zone: String,
    pub state: VolumeState,
    pub attachment: Option<VolumeAttachment>,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateVolumeRequest {
    pub size_gib: u64,
    pub volume_type: DiskType,
    pub iops: Option<u32>,
    pub encrypted: bool,
    pub kms_key_id: Option<String>,
    pub availability_zone: String,
    pub tags: Tags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModificationState {
    Modifying,
    Optimizing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotState {
    Pending,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    /// Source volume; absent for snapshots created by an image copy.
    pub volume_id: Option<VolumeId>,
    pub description: String,
    pub state: SnapshotState,
    pub start_time: DateTime<Utc>,
    pub tags: Tags,
}

// =============================================================================
// Images
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageState {
    Pending,
    Available,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: ImageId,
    pub name: String,
    pub state: ImageState,
    /// Device name of the root volume, e.g. `/dev/xvda`.
    pub root_device_name: String,
    /// Size of the root volume's backing snapshot.
    pub root_device_size_gib: u64,
    pub encrypted: bool,
    pub kms_key_id: Option<String>,
    /// Snapshots backing the image's block device mappings.
    pub snapshot_ids: Vec<SnapshotId>,
    pub creation_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyImageRequest {
    pub source_image_id: ImageId,
    pub source_region: String,
    pub name: String,
    pub encrypted: bool,
    pub kms_key_id: Option<String>,
}

// =============================================================================
// Instances
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
}

/// One entry of a launch-time block device mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockDeviceMapping {
    /// A network block volume created with the instance.
    Ebs {
        device_name: String,
        size_gib: u64,
        volume_type: DiskType,
        iops: Option<u32>,
        encrypted: bool,
        kms_key_id: Option<String>,
        delete_on_termination: bool,
    },
    /// A local instance-store volume exposed under `virtual_name`.
    InstanceStore {
        device_name: String,
        virtual_name: String,
    },
}

impl BlockDeviceMapping {
    pub fn device_name(&self) -> &str {
        match self {
            BlockDeviceMapping::Ebs { device_name, .. }
            | BlockDeviceMapping::InstanceStore { device_name, .. } => device_name,
        }
    }
}

/// A network interface to create at launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterfaceRequest {
    pub device_index: u32,
    pub subnet_id: SubnetId,
    pub private_ip: Option<Ipv4Addr>,
    pub ipv6_addresses: Vec<Ipv6Addr>,
    pub security_groups: Vec<SecurityGroupId>,
    pub associate_public_ip: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub image_id: ImageId,
    pub instance_type: String,
    pub availability_zone: Option<String>,
    pub key_name: Option<String>,
    pub iam_instance_profile: Option<String>,
    pub placement_group: Option<String>,
    pub tenancy: Option<String>,
    pub block_device_mappings: Vec<BlockDeviceMapping>,
    pub network_interfaces: Vec<NetworkInterfaceRequest>,
    pub tags: Tags,
}

/// A volume as seen from the instance it is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedVolume {
    pub device_name: String,
    pub volume_id: VolumeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub state: InstanceState,
    pub instance_type: String,
    pub image_id: ImageId,
    pub availability_zone: String,
    pub root_device_name: String,
    pub private_ip: Option<IpAddr>,
    pub public_ip: Option<IpAddr>,
    pub source_dest_check: bool,
    pub block_devices: Vec<AttachedVolume>,
    pub tags: Tags,
}

// =============================================================================
// Networking
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: SubnetId,
    pub vpc_id: VpcId,
    pub availability_zone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: SecurityGroupId,
    pub name: String,
    pub vpc_id: VpcId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub destination_cidr: String,
    pub instance_id: Option<InstanceId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTable {
    pub id: RouteTableId,
    pub routes: Vec<Route>,
}

// =============================================================================
// API
// =============================================================================

/// Remote compute API.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    // --- instances ---

    /// Launch one instance. Returns it in whatever state the provider reports.
    async fn run_instance(&self, request: &LaunchRequest) -> ApiResult<Instance>;

    async fn describe_instance(&self, id: &InstanceId) -> ApiResult<Option<Instance>>;

    async fn terminate_instance(&self, id: &InstanceId) -> ApiResult<()>;

    async fn reboot_instance(&self, id: &InstanceId) -> ApiResult<()>;

    async fn set_source_dest_check(&self, id: &InstanceId, enabled: bool) -> ApiResult<()>;

    async fn associate_address(&self, id: &InstanceId, public_ip: IpAddr) -> ApiResult<()>;

    /// Merge `tags` into the tag set of any taggable resource.
    async fn create_tags(&self, resource_id: &str, tags: &Tags) -> ApiResult<()>;

    // --- volumes ---

    async fn create_volume(&self, request: &CreateVolumeRequest) -> ApiResult<Volume>;

    async fn describe_volume(&self, id: &VolumeId) -> ApiResult<Option<Volume>>;

    async fn delete_volume(&self, id: &VolumeId) -> ApiResult<()>;

    async fn attach_volume(
        &self,
        volume: &VolumeId,
        instance: &InstanceId,
        device: &str,
    ) -> ApiResult<()>;

    async fn detach_volume(&self, volume: &VolumeId, instance: &InstanceId) -> ApiResult<()>;

    async fn modify_volume(&self, id: &VolumeId, size_gib: u64) -> ApiResult<()>;

    /// State of the most recent modification, if any.
    async fn describe_volume_modification(
        &self,
        id: &VolumeId,
    ) -> ApiResult<Option<ModificationState>>;

    // --- snapshots ---

    async fn create_snapshot(&self, volume: &VolumeId, description: &str) -> ApiResult<Snapshot>;

    async fn delete_snapshot(&self, id: &SnapshotId) -> ApiResult<()>;

    // --- images ---

    async fn describe_image(&self, id: &ImageId) -> ApiResult<Option<Image>>;

    async fn copy_image(&self, request: &CopyImageRequest) -> ApiResult<ImageId>;

    async fn deregister_image(&self, id: &ImageId) -> ApiResult<()>;

    // --- networking ---

    async fn describe_subnet(&self, id: &SubnetId) -> ApiResult<Option<Subnet>>;

    /// Look up security groups by name within one VPC. Unknown names are
    /// simply absent from the result.
    async fn find_security_groups(
        &self,
        vpc: &VpcId,
        names: &[String],
    ) -> ApiResult<Vec<SecurityGroup>>;

    async fn describe_route_table(&self, id: &RouteTableId) -> ApiResult<Option<RouteTable>>;

    async fn create_route(
        &self,
        table: &RouteTableId,
        destination_cidr: &str,
        instance: &InstanceId,
    ) -> ApiResult<()>;

    async fn replace_route(
        &self,
        table: &RouteTableId,
        destination_cidr: &str,
        instance: &InstanceId,
    ) -> ApiResult<()>;

    // --- load balancing ---

    /// Register with a classic load balancer by name.
    async fn register_with_load_balancer(&self, name: &str, instance: &InstanceId)
        -> ApiResult<()>;

    async fn deregister_from_load_balancer(
        &self,
        name: &str,
        instance: &InstanceId,
    ) -> ApiResult<()>;

    /// Classic load balancers the instance is currently registered with.
    async fn load_balancers_for_instance(&self, instance: &InstanceId) -> ApiResult<Vec<String>>;

    /// Register with a target group by name or ARN.
    async fn register_target(&self, target_group: &str, instance: &InstanceId) -> ApiResult<()>;

    async fn deregister_target(&self, target_group: &str, instance: &InstanceId)
        -> ApiResult<()>;

    /// Target groups the instance is currently registered with.
    async fn target_groups_for_instance(&self, instance: &InstanceId) -> ApiResult<Vec<String>>;
}
