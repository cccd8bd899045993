//! Agent settings document.
//!
//! Written to the registry when a VM is created and kept up to date as
//! persistent disks are attached and detached. The agent on the VM reads
//! it at boot to learn its identity, networks and disk layout.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSettings {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicePath {
    pub path: String,
}

/// The `disks` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSettings {
    /// Root device name.
    pub system: String,
    /// Persistent disks keyed by disk id.
    #[serde(default)]
    pub persistent: BTreeMap<String, DevicePath>,
    /// Ephemeral device, `null` when the VM has none.
    pub ephemeral: Option<String>,
    #[serde(default)]
    pub raw_ephemeral: Vec<DevicePath>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    pub agent_id: String,
    pub vm: VmSettings,
    /// Network spec as received from the orchestrator.
    #[serde(default)]
    pub networks: Value,
    pub disks: DiskSettings,
    #[serde(default)]
    pub env: Value,
    /// Agent configuration from the CPI config (mbus, ntp, blobstore).
    #[serde(flatten)]
    pub agent: Map<String, Value>,
}

impl AgentSettings {
    /// Record a persistent disk at `path`.
    pub fn attach_persistent_disk(&mut self, disk_id: &str, path: &str) {
        self.disks.persistent.insert(
            disk_id.to_string(),
            DevicePath {
                path: path.to_string(),
            },
        );
    }

    /// Forget a persistent disk. Returns true if it was recorded.
    pub fn detach_persistent_disk(&mut self, disk_id: &str) -> bool {
        self.disks.persistent.remove(disk_id).is_some()
    }
}
