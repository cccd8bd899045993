//! Shared fixture: a seeded simulator, an in-memory registry and managers
//! wired the way the dispatcher wires them.

#![allow(dead_code)]

use std::sync::Arc;

use cpi::cloud::{MemoryCloud, SeedImage};
use cpi::config::{CloudConfig, Config};
use cpi::context::CloudContext;
use cpi::disk::DiskManager;
use cpi::registry::MemoryRegistry;
use cpi::stemcell::{Stemcell, StemcellManager};
use cpi::vm::VmManager;
use cpi::Cpi;
use cpi_id::{ImageId, SecurityGroupId, SubnetId, VpcId};
use serde_json::{json, Value};

pub const REGION: &str = "us-east-1";
pub const ZONE: &str = "us-east-1a";

pub struct Fixture {
    pub cloud: Arc<MemoryCloud>,
    pub registry: Arc<MemoryRegistry>,
    pub config: Config,
    pub vpc: VpcId,
    pub subnet: SubnetId,
    pub security_group: SecurityGroupId,
    pub image: ImageId,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Build a fixture after letting `customize` adjust the config.
    pub fn with_config(customize: impl FnOnce(&mut Config)) -> Self {
        let cloud = Arc::new(MemoryCloud::new(REGION));
        let vpc = cloud.add_vpc();
        let subnet = cloud.add_subnet(&vpc, ZONE);
        let security_group = cloud.add_security_group(&vpc, "default");
        let image = cloud.add_image(SeedImage::default());

        let mut cloud_config = CloudConfig::new(REGION);
        cloud_config.default_security_groups = vec!["default".to_string()];
        let mut config = Config::new(cloud_config);
        customize(&mut config);

        Self {
            cloud,
            registry: Arc::new(MemoryRegistry::new()),
            config,
            vpc,
            subnet,
            security_group,
            image,
        }
    }

    pub fn context(&self) -> Arc<CloudContext> {
        Arc::new(CloudContext::new(
            self.config.clone(),
            self.cloud.clone(),
            self.registry.clone(),
        ))
    }

    pub fn vms(&self) -> VmManager {
        VmManager::new(self.context())
    }

    pub fn disks(&self) -> DiskManager {
        DiskManager::new(self.context())
    }

    pub fn stemcells(&self) -> StemcellManager {
        StemcellManager::new(self.context())
    }

    pub fn cpi(&self) -> Cpi {
        Cpi::new(self.config.clone(), self.cloud.clone(), self.registry.clone())
    }

    /// The seeded image as a light stemcell.
    pub fn stemcell(&self) -> Stemcell {
        Stemcell::Referenced(self.image.clone())
    }

    /// A single manual network on the seeded subnet.
    pub fn manual_network(&self, ip: &str) -> Value {
        json!({
            "default": {
                "type": "manual",
                "ip": ip,
                "netmask": "255.255.255.0",
                "gateway": "10.0.0.1",
                "default": ["dns", "gateway"],
                "cloud_properties": {"subnet": self.subnet.to_string()}
            }
        })
    }

    /// A single dynamic network on the seeded subnet.
    pub fn dynamic_network(&self) -> Value {
        json!({
            "default": {
                "type": "dynamic",
                "cloud_properties": {"subnet": self.subnet.to_string()}
            }
        })
    }
}
