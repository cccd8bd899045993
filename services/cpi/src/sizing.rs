//! Instance type selection from resource requirements.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::{CpiError, CpiResult};
use crate::instance_types;

/// Requirements sent by the orchestrator. Fields are optional so missing
/// ones can be reported together.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VmResources {
    pub cpu: Option<u32>,
    pub ram: Option<u64>,
    pub ephemeral_disk_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SizedEphemeralDisk {
    pub size: u64,
}

/// VM cloud properties satisfying a [`VmResources`] request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SizedCloudProperties {
    pub instance_type: String,
    pub ephemeral_disk: SizedEphemeralDisk,
}

pub fn calculate_vm_cloud_properties(resources: &Value) -> CpiResult<SizedCloudProperties> {
    let resources: VmResources = if resources.is_null() {
        VmResources::default()
    } else {
        serde_json::from_value(resources.clone())
            .map_err(|e| CpiError::validation(format!("Invalid VM resources: {e}")))?
    };

    let (Some(cpu), Some(ram), Some(ephemeral_disk_size)) =
        (resources.cpu, resources.ram, resources.ephemeral_disk_size)
    else {
        let missing: Vec<&str> = [
            ("'cpu'", resources.cpu.is_none()),
            ("'ram'", resources.ram.is_none()),
            ("'ephemeral_disk_size'", resources.ephemeral_disk_size.is_none()),
        ]
        .into_iter()
        .filter_map(|(name, missing)| missing.then_some(name))
        .collect();
        return Err(CpiError::validation(format!(
            "Missing VM cloud properties: {}",
            missing.join(", ")
        )));
    };

    let instance_type = instance_types::smallest_fitting(cpu, ram).ok_or_else(|| {
        CpiError::cloud(format!(
            "Unable to find an instance type with at least {cpu} CPUs and {ram} MiB of RAM"
        ))
    })?;
    info!(cpu, ram, instance_type = %instance_type.name, "Selected instance type");

    Ok(SizedCloudProperties {
        instance_type: instance_type.name.to_string(),
        ephemeral_disk: SizedEphemeralDisk {
            size: ephemeral_disk_size,
        },
    })
}
