//! Disk lifecycle.

use std::sync::Arc;

use cpi_id::{InstanceId, SnapshotId, VolumeId};
use cpi_retry::await_state;
use tracing::{debug, info, warn};

use crate::cloud::{
    AttachmentState, CreateVolumeRequest, ModificationState, Tags, Volume, VolumeState,
};
use crate::context::{CloudContext, RequestContext};
use crate::encryption::{self, EncryptionLayer};
use crate::error::{CpiError, CpiResult};
use crate::metadata::{self, Metadata};
use crate::properties::{mib_to_gib, DiskCloudProperties};

/// Device names available for persistent disks, in preference order.
const PERSISTENT_DEVICES: [&str; 11] = [
    "/dev/sdf", "/dev/sdg", "/dev/sdh", "/dev/sdi", "/dev/sdj", "/dev/sdk", "/dev/sdl",
    "/dev/sdm", "/dev/sdn", "/dev/sdo", "/dev/sdp",
];

/// Creates, attaches, detaches, resizes, snapshots and deletes volumes.
#[derive(Clone)]
pub struct DiskManager {
    ctx: Arc<CloudContext>,
}

impl DiskManager {
    pub fn new(ctx: Arc<CloudContext>) -> Self {
        Self { ctx }
    }

    /// Create a volume of `size_mib`, in `vm`'s zone when given.
    pub async fn create_disk(
        &self,
        size_mib: u64,
        props: &DiskCloudProperties,
        vm: Option<&InstanceId>,
    ) -> CpiResult<VolumeId> {
        let size_gib = mib_to_gib(size_mib);
        if size_gib == 0 {
            return Err(CpiError::validation("disk size must be greater than 0"));
        }

        let volume_type = props.disk_type.unwrap_or_default();
        let iops = if volume_type.requires_iops() {
            Some(props.iops.ok_or_else(|| {
                CpiError::validation(format!(
                    "Must specify an 'iops' value when the volume type is '{volume_type}'"
                ))
            })?)
        } else {
            None
        };

        let encryption = encryption::resolve(
            &self.ctx.config.cloud.encryption(),
            &EncryptionLayer::default(),
            &props.encryption(),
        );

        let availability_zone = match vm {
            Some(vm) => self.ctx.require_instance(vm).await?.availability_zone,
            None => self.ctx.config.cloud.default_zone(),
        };

        let request = CreateVolumeRequest {
            size_gib,
            volume_type,
            iops,
            encrypted: encryption.encrypted,
            kms_key_id: encryption.key_ref,
            availability_zone,
            tags: self.ctx.config.cloud.default_tags.clone(),
        };

        let volume = self
            .ctx
            .retry("create_volume", || self.ctx.compute.create_volume(&request))
            .await?;

        info!(
            disk_id = %volume.id,
            size_gib,
            volume_type = %volume_type,
            encrypted = request.encrypted,
            availability_zone = %request.availability_zone,
            "Creating disk"
        );

        let created = self
            .await_volume(&volume.id, "available", |v| {
                v.as_ref()
                    .is_some_and(|v| matches!(v.state, VolumeState::Available | VolumeState::Error))
            })
            .await?;
        if created.is_some_and(|v| v.state == VolumeState::Error) {
            return Err(CpiError::cloud(format!(
                "Volume {} failed to become available",
                volume.id
            )));
        }

        Ok(volume.id)
    }

    /// Delete a volume. Absent volumes count as deleted.
    pub async fn delete_disk(&self, id: &VolumeId) -> CpiResult<()> {
        let result = self
            .ctx
            .retry("delete_volume", || self.ctx.compute.delete_volume(id))
            .await;

        match result {
            Ok(()) => {
                info!(disk_id = %id, "Deleted disk");
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                info!(disk_id = %id, "Disk not found, nothing to delete");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn has_disk(&self, id: &VolumeId) -> CpiResult<bool> {
        Ok(self.ctx.describe_volume(id).await?.is_some())
    }

    /// Attach a disk and return its device name.
    pub async fn attach_disk(&self, vm: &InstanceId, disk: &VolumeId) -> CpiResult<String> {
        let instance = self.ctx.require_instance(vm).await?;
        let volume = self.ctx.require_volume(disk).await?;

        let device = match &volume.attachment {
            Some(attachment) if attachment.instance_id == *vm => {
                info!(disk_id = %disk, vm_id = %vm, device = %attachment.device, "Disk already attached");
                attachment.device.clone()
            }
            Some(attachment) => {
                return Err(CpiError::cloud(format!(
                    "Disk {disk} is attached to another VM ({})",
                    attachment.instance_id
                )));
            }
            None => {
                let in_use: Vec<&str> = instance
                    .block_devices
                    .iter()
                    .map(|b| b.device_name.as_str())
                    .collect();
                let device = PERSISTENT_DEVICES
                    .iter()
                    .find(|d| !in_use.contains(*d))
                    .ok_or_else(|| {
                        CpiError::cloud(format!("No free device names left on VM {vm}"))
                    })?
                    .to_string();

                info!(disk_id = %disk, vm_id = %vm, device = %device, "Attaching disk");
                self.ctx
                    .retry("attach_volume", || {
                        self.ctx.compute.attach_volume(disk, vm, &device)
                    })
                    .await?;

                self.await_volume(disk, "attached", |v| {
                    v.as_ref()
                        .and_then(|v| v.attachment.as_ref())
                        .is_some_and(|a| a.state == AttachmentState::Attached)
                })
                .await?;
                device
            }
        };

        match self.ctx.registry.read_settings(vm).await {
            Ok(mut settings) => {
                settings.attach_persistent_disk(disk.as_str(), &device);
                self.ctx.registry.update_settings(vm, &settings).await?;
            }
            Err(err) if err.is_not_found() => {
                warn!(vm_id = %vm, "No registry settings for VM, skipping update");
            }
            Err(err) => return Err(err.into()),
        }

        Ok(device)
    }

    /// Detach a disk. Absent or unattached disks are a no-op.
    pub async fn detach_disk(&self, vm: &InstanceId, disk: &VolumeId) -> CpiResult<()> {
        let Some(volume) = self.ctx.describe_volume(disk).await? else {
            info!(disk_id = %disk, vm_id = %vm, "Disk not found, nothing to detach");
            return Ok(());
        };

        match &volume.attachment {
            None => {
                info!(disk_id = %disk, vm_id = %vm, "Disk is not attached");
            }
            Some(attachment) if attachment.instance_id != *vm => {
                return Err(CpiError::DiskNotAttached {
                    vm: vm.to_string(),
                    disk: disk.to_string(),
                });
            }
            Some(attachment) => {
                if attachment.state != AttachmentState::Detaching {
                    info!(disk_id = %disk, vm_id = %vm, device = %attachment.device, "Detaching disk");
                    self.ctx
                        .retry("detach_volume", || {
                            self.ctx.compute.detach_volume(disk, vm)
                        })
                        .await?;
                }

                self.await_volume(disk, "detached", |v| {
                    v.as_ref().is_none_or(|v| v.attachment.is_none())
                })
                .await?;
            }
        }

        match self.ctx.registry.read_settings(vm).await {
            Ok(mut settings) => {
                if settings.detach_persistent_disk(disk.as_str()) {
                    self.ctx.registry.update_settings(vm, &settings).await?;
                }
            }
            Err(err) if err.is_not_found() => {
                warn!(vm_id = %vm, "No registry settings for VM, skipping update");
            }
            Err(err) => return Err(err.into()),
        }

        Ok(())
    }

    /// Grow a disk to `new_size_mib`.
    pub async fn resize_disk(&self, disk: &VolumeId, new_size_mib: u64) -> CpiResult<()> {
        let new_size_gib = mib_to_gib(new_size_mib);
        let volume = self.ctx.require_volume(disk).await?;

        if new_size_gib < volume.size_gib {
            return Err(CpiError::cloud(format!(
                "Cannot resize disk {disk} from {} GiB to {new_size_gib} GiB: disks cannot shrink",
                volume.size_gib
            )));
        }
        if new_size_gib == volume.size_gib {
            info!(disk_id = %disk, size_gib = new_size_gib, "Disk already at requested size");
            return Ok(());
        }

        info!(disk_id = %disk, from_gib = volume.size_gib, to_gib = new_size_gib, "Resizing disk");
        self.ctx
            .retry("modify_volume", || {
                self.ctx.compute.modify_volume(disk, new_size_gib)
            })
            .await?;

        let state = await_state(
            disk.as_str(),
            "modified",
            &self.ctx.retry,
            || self.ctx.compute.describe_volume_modification(disk),
            |s| {
                matches!(
                    s,
                    Some(
                        ModificationState::Completed
                            | ModificationState::Optimizing
                            | ModificationState::Failed
                    )
                )
            },
        )
        .await?;

        if state == Some(ModificationState::Failed) {
            return Err(CpiError::cloud(format!("Resizing disk {disk} failed")));
        }
        Ok(())
    }

    /// Snapshot a disk, tagging the snapshot from `metadata`.
    pub async fn snapshot_disk(
        &self,
        disk: &VolumeId,
        metadata: &Metadata,
        request: &RequestContext,
    ) -> CpiResult<SnapshotId> {
        let volume = self.ctx.require_volume(disk).await?;
        let device = volume.attachment.as_ref().map(|a| a.device.as_str());
        let description = metadata::snapshot_description(metadata, device);

        let snapshot = self
            .ctx
            .retry("create_snapshot", || {
                self.ctx.compute.create_snapshot(disk, &description)
            })
            .await?;
        info!(disk_id = %disk, snapshot_id = %snapshot.id, description = %description, "Created snapshot");

        let tags = self.snapshot_tags(&volume, metadata, request, &description);
        self.ctx
            .retry("create_tags", || {
                self.ctx.compute.create_tags(snapshot.id.as_str(), &tags)
            })
            .await?;

        Ok(snapshot.id)
    }

    fn snapshot_tags(
        &self,
        volume: &Volume,
        metadata: &Metadata,
        request: &RequestContext,
        description: &str,
    ) -> Tags {
        let mut tags = metadata::to_tags(metadata);
        let lookup = |key: &str| {
            metadata
                .get(key)
                .map(metadata::stringify)
                .filter(|s| !s.is_empty())
        };

        if let Some(attachment) = &volume.attachment {
            metadata::insert_tag(&mut tags, "device", &attachment.device);
        }
        if let Some(agent_id) = lookup("agent_id") {
            metadata::insert_tag(&mut tags, "agent_id", &agent_id);
        }
        let vm_id = volume
            .attachment
            .as_ref()
            .map(|a| a.instance_id.to_string())
            .or_else(|| lookup("vm_id"))
            .or_else(|| lookup("instance_id"));
        if let Some(vm_id) = vm_id {
            metadata::insert_tag(&mut tags, "vm_id", &vm_id);
            metadata::insert_tag(&mut tags, "instance_id", &vm_id);
        }
        if let Some(director) = lookup("director_name") {
            metadata::insert_tag(&mut tags, &self.ctx.config.cloud.director_tag_key, &director);
        }
        if let Some(uuid) = lookup("director_uuid").or_else(|| request.director_uuid.clone()) {
            metadata::insert_tag(&mut tags, "director_uuid", &uuid);
        }
        metadata::insert_tag(&mut tags, "Name", description);
        tags
    }

    /// Delete a snapshot. Absent snapshots count as deleted.
    pub async fn delete_snapshot(&self, id: &SnapshotId) -> CpiResult<()> {
        let result = self
            .ctx
            .retry("delete_snapshot", || self.ctx.compute.delete_snapshot(id))
            .await;

        match result {
            Ok(()) => {
                info!(snapshot_id = %id, "Deleted snapshot");
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                info!(snapshot_id = %id, "Snapshot not found, nothing to delete");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Tag a disk from `metadata`.
    pub async fn set_disk_metadata(&self, disk: &VolumeId, metadata: &Metadata) -> CpiResult<()> {
        self.ctx.require_volume(disk).await?;
        let tags = metadata::to_tags(metadata);
        debug!(disk_id = %disk, tags = tags.len(), "Tagging disk");
        self.ctx
            .retry("create_tags", || {
                self.ctx.compute.create_tags(disk.as_str(), &tags)
            })
            .await?;
        Ok(())
    }

    async fn await_volume<P>(
        &self,
        id: &VolumeId,
        target: &str,
        predicate: P,
    ) -> CpiResult<Option<Volume>>
    where
        P: Fn(&Option<Volume>) -> bool,
    {
        Ok(await_state(
            id.as_str(),
            target,
            &self.ctx.retry,
            || self.ctx.compute.describe_volume(id),
            predicate,
        )
        .await?)
    }
}
