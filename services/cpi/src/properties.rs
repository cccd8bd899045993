//! Typed cloud properties.
//!
//! Each resource class gets its own struct with explicit defaults. Unknown
//! keys are rejected so that typos in a manifest surface as errors instead
//! of silently falling back to defaults.

use std::collections::BTreeMap;
use std::net::IpAddr;

use cpi_id::{RouteTableId, SubnetId};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::cloud::{DiskType, Tags};
use crate::encryption::EncryptionLayer;
use crate::error::{CpiError, CpiResult};

/// Default ephemeral disk size when none is requested.
pub const DEFAULT_EPHEMERAL_DISK_GIB: u64 = 10;

/// Convert a size in the orchestrator's unit (MiB) to whole GiB, rounding up.
pub fn mib_to_gib(size_mib: u64) -> u64 {
    size_mib.div_ceil(1024)
}

/// Decode a cloud-properties object. `null` is treated as `{}`.
pub fn parse<T: DeserializeOwned>(class: &str, value: &Value) -> CpiResult<T> {
    let value = if value.is_null() {
        Value::Object(Default::default())
    } else {
        value.clone()
    };
    serde_json::from_value(value)
        .map_err(|e| CpiError::validation(format!("Invalid {class} cloud properties: {e}")))
}

fn default_true() -> bool {
    true
}

/// Route to point at the VM after creation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdvertisedRoute {
    pub table_id: RouteTableId,
    pub destination: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RootDisk {
    pub size: Option<u64>,
    #[serde(rename = "type")]
    pub disk_type: Option<DiskType>,
    pub iops: Option<u32>,
    pub encrypted: Option<bool>,
    pub kms_key_arn: Option<String>,
}

impl RootDisk {
    pub fn encryption(&self) -> EncryptionLayer {
        EncryptionLayer::new(self.encrypted, self.kms_key_arn.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EphemeralDisk {
    pub size: Option<u64>,
    #[serde(rename = "type")]
    pub disk_type: Option<DiskType>,
    pub iops: Option<u32>,
    #[serde(default)]
    pub use_instance_storage: bool,
    pub encrypted: Option<bool>,
    pub kms_key_arn: Option<String>,
}

impl EphemeralDisk {
    pub fn encryption(&self) -> EncryptionLayer {
        EncryptionLayer::new(self.encrypted, self.kms_key_arn.clone())
    }
}

/// VM type cloud properties.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VmCloudProperties {
    pub instance_type: Option<String>,
    pub availability_zone: Option<String>,
    pub key_name: Option<String>,
    pub security_groups: Vec<String>,
    pub iam_instance_profile: Option<String>,
    pub placement_group: Option<String>,
    pub tenancy: Option<String>,
    pub elbs: Vec<String>,
    pub lb_target_groups: Vec<String>,
    pub advertised_routes: Vec<AdvertisedRoute>,
    #[serde(default = "default_true")]
    pub source_dest_check: bool,
    pub auto_assign_public_ip: bool,
    pub root_disk: RootDisk,
    pub ephemeral_disk: EphemeralDisk,
    pub raw_instance_storage: bool,
    pub tags: Tags,
}

impl Default for VmCloudProperties {
    fn default() -> Self {
        Self {
            instance_type: None,
            availability_zone: None,
            key_name: None,
            security_groups: Vec::new(),
            iam_instance_profile: None,
            placement_group: None,
            tenancy: None,
            elbs: Vec::new(),
            lb_target_groups: Vec::new(),
            advertised_routes: Vec::new(),
            source_dest_check: true,
            auto_assign_public_ip: false,
            root_disk: RootDisk::default(),
            ephemeral_disk: EphemeralDisk::default(),
            raw_instance_storage: false,
            tags: Tags::new(),
        }
    }
}

/// Disk type cloud properties.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiskCloudProperties {
    #[serde(rename = "type")]
    pub disk_type: Option<DiskType>,
    pub iops: Option<u32>,
    pub encrypted: Option<bool>,
    pub kms_key_arn: Option<String>,
}

impl DiskCloudProperties {
    pub fn encryption(&self) -> EncryptionLayer {
        EncryptionLayer::new(self.encrypted, self.kms_key_arn.clone())
    }
}

/// Stemcell manifest cloud properties.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StemcellProperties {
    pub name: Option<String>,
    pub version: Option<Value>,
    pub infrastructure: Option<String>,
    pub hypervisor: Option<String>,
    pub disk: Option<u64>,
    pub disk_format: Option<String>,
    pub container_format: Option<String>,
    pub os_type: Option<String>,
    pub os_distro: Option<String>,
    pub architecture: Option<String>,
    pub root_device_name: Option<String>,
    pub virtualization_type: Option<String>,
    /// Source image per region.
    pub ami: BTreeMap<String, String>,
    pub encrypted: Option<bool>,
    pub kms_key_arn: Option<String>,
}

impl StemcellProperties {
    pub fn encryption(&self) -> EncryptionLayer {
        EncryptionLayer::new(self.encrypted, self.kms_key_arn.clone())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    #[default]
    Manual,
    Dynamic,
    /// A secondary IPv6 address on the interface for its subnet.
    Ipv6,
    Vip,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkCloudProperties {
    pub subnet: Option<SubnetId>,
    pub security_groups: Vec<String>,
}

/// One entry of the orchestrator's network spec.
///
/// Only the fields used for planning are typed; the raw spec is passed
/// through to the agent untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NetworkSpec {
    #[serde(rename = "type")]
    pub network_type: NetworkType,
    pub ip: Option<IpAddr>,
    pub netmask: Option<String>,
    pub gateway: Option<String>,
    pub dns: Vec<String>,
    pub default: Vec<String>,
    pub mac: Option<String>,
    pub prefix: Option<String>,
    pub cloud_properties: NetworkCloudProperties,
}
