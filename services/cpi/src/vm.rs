//! VM lifecycle.
//!
//! `create_vm` composes the other components:
//! 1. plan block devices from the stemcell image and instance type
//! 2. resolve encryption for the root and ephemeral volumes
//! 3. resolve network interfaces and security groups
//! 4. launch and wait for `running`
//! 5. write agent settings, advertise routes
//! 6. register with load balancers
//!
//! A failure in steps 4-5 after the instance exists terminates it before the
//! error is returned. Load balancer failures leave the VM in place.

use std::collections::BTreeSet;
use std::sync::Arc;

use cpi_id::{InstanceId, Ulid, VolumeId};
use cpi_retry::await_state;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::cloud::{Instance, InstanceState, LaunchRequest, Tags};
use crate::context::{CloudContext, RequestContext};
use crate::device_map::{self, DeviceMapPlan, DiskEncryption};
use crate::encryption::{self, EncryptionLayer};
use crate::error::{CpiError, CpiResult};
use crate::instance_types;
use crate::metadata::{self, Metadata};
use crate::network::{self, NetworkConfigurator, ResolvedNetworks};
use crate::properties::VmCloudProperties;
use crate::settings::{AgentSettings, DevicePath, DiskSettings, VmSettings};
use crate::stemcell::Stemcell;

/// Result of `create_vm`.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedVm {
    pub vm_id: InstanceId,
    /// Network settings as handed to the agent.
    pub networks: Value,
}

#[derive(Clone)]
pub struct VmManager {
    ctx: Arc<CloudContext>,
    network: NetworkConfigurator,
}

impl VmManager {
    pub fn new(ctx: Arc<CloudContext>) -> Self {
        let network = NetworkConfigurator::new(ctx.clone());
        Self { ctx, network }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_vm(
        &self,
        agent_id: &str,
        stemcell: &Stemcell,
        props: &VmCloudProperties,
        networks: &Value,
        disk_locality: &[VolumeId],
        env: &Value,
        request: &RequestContext,
    ) -> CpiResult<CreatedVm> {
        let instance_type = props
            .instance_type
            .as_deref()
            .ok_or_else(|| CpiError::validation("Missing VM cloud properties: 'instance_type'"))?;

        let image = self
            .ctx
            .retry("describe_image", || {
                self.ctx.compute.describe_image(stemcell.image_id())
            })
            .await?
            .ok_or_else(|| CpiError::cloud(format!("Stemcell image {stemcell} not found")))?;

        let global = self.ctx.config.cloud.encryption();
        let encryption = DiskEncryption {
            root: encryption::resolve(&global, &EncryptionLayer::default(), &props.root_disk.encryption()),
            ephemeral: encryption::resolve(
                &global,
                &EncryptionLayer::default(),
                &props.ephemeral_disk.encryption(),
            ),
        };
        let plan = device_map::plan(
            &image,
            props,
            &instance_types::resolve(instance_type),
            &encryption,
        )?;

        let specs = network::parse_network_specs(networks)?;
        let resolved = self
            .network
            .resolve(&specs, &props.security_groups, props.auto_assign_public_ip)
            .await?;

        let availability_zone = self.select_zone(props, &resolved, disk_locality).await?;

        let launch = LaunchRequest {
            image_id: image.id.clone(),
            instance_type: instance_type.to_string(),
            availability_zone: Some(availability_zone),
            key_name: props
                .key_name
                .clone()
                .or_else(|| self.ctx.config.cloud.default_key_name.clone()),
            iam_instance_profile: props
                .iam_instance_profile
                .clone()
                .or_else(|| self.ctx.config.cloud.default_iam_instance_profile.clone()),
            placement_group: props.placement_group.clone(),
            tenancy: props.tenancy.clone(),
            block_device_mappings: plan.block_device_mappings(),
            network_interfaces: resolved.interfaces.clone(),
            tags: self.launch_tags(agent_id, props, request),
        };

        let instance = self
            .ctx
            .retry_throttled("run_instance", || self.ctx.compute.run_instance(&launch))
            .await?;
        info!(
            vm_id = %instance.id,
            agent_id,
            instance_type,
            availability_zone = %instance.availability_zone,
            "Launched VM"
        );

        if let Err(err) = self
            .configure(&instance, agent_id, props, &plan, &resolved, networks, env)
            .await
        {
            warn!(vm_id = %instance.id, error = %err, "VM configuration failed, terminating");
            if let Err(cleanup) = self.ctx.compute.terminate_instance(&instance.id).await {
                warn!(vm_id = %instance.id, error = %cleanup, "Failed to terminate VM");
            }
            return Err(err);
        }

        self.network
            .register_load_balancers(&instance.id, &props.elbs, &props.lb_target_groups)
            .await?;

        Ok(CreatedVm {
            vm_id: instance.id,
            networks: networks.clone(),
        })
    }

    /// Post-launch steps whose failure terminates the instance.
    #[allow(clippy::too_many_arguments)]
    async fn configure(
        &self,
        instance: &Instance,
        agent_id: &str,
        props: &VmCloudProperties,
        plan: &DeviceMapPlan,
        resolved: &ResolvedNetworks,
        networks: &Value,
        env: &Value,
    ) -> CpiResult<()> {
        let id = &instance.id;

        await_state(
            id.as_str(),
            "running",
            &self.ctx.retry,
            || self.ctx.compute.describe_instance(id),
            |i| i.as_ref().is_some_and(|i| i.state == InstanceState::Running),
        )
        .await?;

        if !props.source_dest_check {
            self.ctx
                .retry("set_source_dest_check", || {
                    self.ctx.compute.set_source_dest_check(id, false)
                })
                .await?;
        }

        if let Some(vip) = resolved.vip {
            self.ctx
                .retry("associate_address", || {
                    self.ctx.compute.associate_address(id, vip)
                })
                .await?;
            info!(vm_id = %id, public_ip = %vip, "Associated elastic IP");
        }

        let settings = self.agent_settings(agent_id, plan, networks, env);
        self.ctx.registry.update_settings(id, &settings).await?;

        self.network
            .apply_routes(id, &props.advertised_routes)
            .await?;
        Ok(())
    }

    fn agent_settings(
        &self,
        agent_id: &str,
        plan: &DeviceMapPlan,
        networks: &Value,
        env: &Value,
    ) -> AgentSettings {
        AgentSettings {
            agent_id: agent_id.to_string(),
            vm: VmSettings {
                name: format!("vm-{}", Ulid::new().to_string().to_lowercase()),
            },
            networks: networks.clone(),
            disks: DiskSettings {
                system: plan.system_device().to_string(),
                persistent: Default::default(),
                ephemeral: plan.agent_ephemeral.clone(),
                raw_ephemeral: plan
                    .raw_ephemeral
                    .iter()
                    .map(|path| DevicePath { path: path.clone() })
                    .collect(),
            },
            env: if env.is_null() {
                Value::Object(Map::new())
            } else {
                env.clone()
            },
            agent: self.ctx.config.agent.clone(),
        }
    }

    fn launch_tags(
        &self,
        agent_id: &str,
        props: &VmCloudProperties,
        request: &RequestContext,
    ) -> Tags {
        let cloud = &self.ctx.config.cloud;
        let mut tags = Tags::new();
        for (key, value) in cloud.default_tags.iter().chain(props.tags.iter()) {
            metadata::insert_tag(&mut tags, key, value);
        }
        metadata::insert_tag(&mut tags, "agent_id", agent_id);
        if let Some(uuid) = &request.director_uuid {
            metadata::insert_tag(&mut tags, &cloud.director_tag_key, uuid);
        }
        tags
    }

    /// Pick the zone from the VM properties, the subnets and the disks the
    /// VM should sit next to. They must agree.
    async fn select_zone(
        &self,
        props: &VmCloudProperties,
        resolved: &ResolvedNetworks,
        disk_locality: &[VolumeId],
    ) -> CpiResult<String> {
        let mut zones = BTreeSet::new();
        let mut sources = Vec::new();

        if let Some(zone) = &props.availability_zone {
            zones.insert(zone.clone());
            sources.push(format!("VM properties in {zone}"));
        }
        zones.insert(resolved.availability_zone.clone());
        sources.push(format!("subnet in {}", resolved.availability_zone));

        for disk in disk_locality {
            match self.ctx.describe_volume(disk).await? {
                Some(volume) => {
                    sources.push(format!("disk {disk} in {}", volume.availability_zone));
                    zones.insert(volume.availability_zone);
                }
                None => warn!(disk_id = %disk, "Disk locality references a missing disk"),
            }
        }

        if zones.len() > 1 {
            return Err(CpiError::validation(format!(
                "Cannot use multiple availability zones: {}",
                sources.join(", ")
            )));
        }
        Ok(resolved.availability_zone.clone())
    }

    /// Terminate a VM and clean up its settings.
    ///
    /// Load balancer deregistration is best effort: the VM is terminated
    /// either way and deregistration failures are returned afterwards.
    pub async fn delete_vm(&self, id: &InstanceId) -> CpiResult<()> {
        let Some(instance) = self.ctx.live_instance(id).await? else {
            self.delete_settings(id).await?;
            return Err(CpiError::VmNotFound(id.to_string()));
        };

        let deregistered = self.network.deregister_load_balancers(&instance.id).await;
        if let Err(err) = &deregistered {
            warn!(vm_id = %id, error = %err, "Continuing to terminate VM");
        }

        match self
            .ctx
            .retry("terminate_instance", || self.ctx.compute.terminate_instance(id))
            .await
        {
            Ok(()) => info!(vm_id = %id, "Terminating VM"),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }

        await_state(
            id.as_str(),
            "terminated",
            &self.ctx.retry,
            || self.ctx.compute.describe_instance(id),
            |i| i.as_ref().is_none_or(|i| i.state == InstanceState::Terminated),
        )
        .await?;

        self.delete_settings(id).await?;
        deregistered
    }

    async fn delete_settings(&self, id: &InstanceId) -> CpiResult<()> {
        match self.ctx.registry.delete_settings(id).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// True unless the VM is gone or terminated.
    pub async fn has_vm(&self, id: &InstanceId) -> CpiResult<bool> {
        Ok(self.ctx.live_instance(id).await?.is_some())
    }

    pub async fn reboot_vm(&self, id: &InstanceId) -> CpiResult<()> {
        self.ctx.require_instance(id).await?;
        self.ctx
            .retry("reboot_instance", || self.ctx.compute.reboot_instance(id))
            .await?;
        info!(vm_id = %id, "Rebooted VM");
        Ok(())
    }

    /// Tag the VM and every attached volume with the same tag set.
    pub async fn set_vm_metadata(&self, id: &InstanceId, metadata: &Metadata) -> CpiResult<()> {
        let instance = self.ctx.require_instance(id).await?;
        let tags = metadata::vm_tags(metadata);

        self.ctx
            .retry("create_tags", || {
                self.ctx.compute.create_tags(id.as_str(), &tags)
            })
            .await?;

        for device in &instance.block_devices {
            self.ctx
                .retry("create_tags", || {
                    self.ctx
                        .compute
                        .create_tags(device.volume_id.as_str(), &tags)
                })
                .await?;
        }

        info!(vm_id = %id, tags = tags.len(), volumes = instance.block_devices.len(), "Tagged VM");
        Ok(())
    }

    /// Attached volumes: root device first, then by device name.
    pub async fn get_disks(&self, id: &InstanceId) -> CpiResult<Vec<VolumeId>> {
        let instance = self.ctx.require_instance(id).await?;

        let mut devices = instance.block_devices;
        devices.sort_by(|a, b| {
            let a_root = a.device_name != instance.root_device_name;
            let b_root = b.device_name != instance.root_device_name;
            (a_root, &a.device_name).cmp(&(b_root, &b.device_name))
        });
        Ok(devices.into_iter().map(|d| d.volume_id).collect())
    }
}
