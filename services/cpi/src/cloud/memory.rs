//! In-memory compute API.
//!
//! `MemoryCloud` keeps every resource in a single mutex-guarded state and
//! drives the same state machines the remote API exposes (instances go
//! `pending -> running`, volumes `creating -> available`, attachments
//! `attaching -> attached`, copied images `pending -> available`). A
//! transition completes after `settle_polls` describe calls, so callers that
//! skip waiting observe the intermediate states.
//!
//! Ids are minted from a sequence counter and are stable across runs that
//! start from the same state.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info};

use super::*;

/// Describe calls needed before a transition completes.
const DEFAULT_SETTLE_POLLS: u32 = 2;

/// Errors loading or saving simulator state.
#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error("failed to access state file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid state file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Image registered through [`MemoryCloud::add_image`].
#[derive(Debug, Clone)]
pub struct SeedImage {
    pub name: String,
    pub root_device_name: String,
    pub root_device_size_gib: u64,
}

impl Default for SeedImage {
    fn default() -> Self {
        Self {
            name: "bosh-stemcell".to_string(),
            root_device_name: "/dev/xvda".to_string(),
            root_device_size_gib: 8,
        }
    }
}

/// Injected failures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct Faults {
    /// Upcoming detach calls answered with `VolumeInUse`.
    busy_detaches: u32,
    /// Key references whose image copy is rejected outright.
    rejected_kms_keys: BTreeSet<String>,
    /// Key references whose image copy ends in `failed`.
    failing_kms_keys: BTreeSet<String>,
    /// Load balancers and target groups that refuse registrations.
    rejecting_load_balancers: BTreeSet<String>,
    /// Load balancers and target groups that refuse deregistrations.
    rejecting_deregistrations: BTreeSet<String>,
    /// Image and snapshot ids whose deletion fails.
    failing_deletes: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimInstance {
    instance: Instance,
    settle: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimModification {
    state: ModificationState,
    target_size_gib: u64,
    settle: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimVolume {
    volume: Volume,
    settle: u32,
    modification: Option<SimModification>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimImage {
    image: Image,
    settle: u32,
    fails: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct SimState {
    region: String,
    settle_polls: u32,
    next_seq: u64,
    instances: BTreeMap<InstanceId, SimInstance>,
    volumes: BTreeMap<VolumeId, SimVolume>,
    snapshots: BTreeMap<SnapshotId, Snapshot>,
    images: BTreeMap<ImageId, SimImage>,
    subnets: BTreeMap<SubnetId, Subnet>,
    security_groups: Vec<SecurityGroup>,
    route_tables: BTreeMap<RouteTableId, RouteTable>,
    load_balancers: BTreeMap<String, BTreeSet<InstanceId>>,
    target_groups: BTreeMap<String, BTreeSet<InstanceId>>,
    faults: Faults,

    #[serde(skip)]
    calls: BTreeMap<String, u32>,
    #[serde(skip)]
    launches: Vec<LaunchRequest>,
}

fn instance_not_found(id: &InstanceId) -> CloudApiError {
    CloudApiError::not_found(
        "InvalidInstanceID.NotFound",
        format!("The instance ID '{id}' does not exist"),
    )
}

fn volume_not_found(id: &VolumeId) -> CloudApiError {
    CloudApiError::not_found(
        "InvalidVolume.NotFound",
        format!("The volume '{id}' does not exist."),
    )
}

fn image_not_found(id: &ImageId) -> CloudApiError {
    CloudApiError::not_found(
        "InvalidAMIID.NotFound",
        format!("The image id '[{id}]' does not exist"),
    )
}

impl SimState {
    fn record(&mut self, op: &str) {
        *self.calls.entry(op.to_string()).or_default() += 1;
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn live_instance_mut(&mut self, id: &InstanceId) -> ApiResult<&mut SimInstance> {
        match self.instances.get_mut(id) {
            Some(sim) if sim.instance.state != InstanceState::Terminated => Ok(sim),
            _ => Err(instance_not_found(id)),
        }
    }

    fn settle_instance(&mut self, id: &InstanceId) {
        let Some(sim) = self.instances.get_mut(id) else {
            return;
        };
        if sim.settle > 0 {
            sim.settle -= 1;
            if sim.settle > 0 {
                return;
            }
        }

        let current = sim.instance.state;
        match current {
            InstanceState::Pending => sim.instance.state = InstanceState::Running,
            InstanceState::Stopping => sim.instance.state = InstanceState::Stopped,
            InstanceState::ShuttingDown => {
                sim.instance.state = InstanceState::Terminated;
                let devices = std::mem::take(&mut sim.instance.block_devices);
                self.release_volumes(devices);
                for members in self
                    .load_balancers
                    .values_mut()
                    .chain(self.target_groups.values_mut())
                {
                    members.remove(id);
                }
            }
            _ => {}
        }
    }

    /// Detach volumes from a terminated instance, deleting the ones marked
    /// delete-on-termination.
    fn release_volumes(&mut self, devices: Vec<AttachedVolume>) {
        for device in devices {
            let Some(sim) = self.volumes.get_mut(&device.volume_id) else {
                continue;
            };
            let delete = sim
                .volume
                .attachment
                .as_ref()
                .is_some_and(|a| a.delete_on_termination);
            if delete {
                self.volumes.remove(&device.volume_id);
            } else {
                sim.volume.attachment = None;
                sim.volume.state = VolumeState::Available;
            }
        }
    }

    fn settle_volume(&mut self, id: &VolumeId) {
        let Some(sim) = self.volumes.get_mut(id) else {
            return;
        };
        if sim.settle > 0 {
            sim.settle -= 1;
            if sim.settle > 0 {
                return;
            }
        }

        if sim.volume.state == VolumeState::Creating {
            sim.volume.state = VolumeState::Available;
        }

        let mut detached = None;
        if let Some(attachment) = sim.volume.attachment.as_mut() {
            match attachment.state {
                AttachmentState::Attaching => attachment.state = AttachmentState::Attached,
                AttachmentState::Detaching => {
                    detached = Some((attachment.instance_id.clone(), attachment.device.clone()));
                }
                AttachmentState::Attached => {}
            }
        }

        if let Some((instance_id, device)) = detached {
            sim.volume.attachment = None;
            sim.volume.state = VolumeState::Available;
            if let Some(owner) = self.instances.get_mut(&instance_id) {
                owner
                    .instance
                    .block_devices
                    .retain(|b| b.device_name != device);
            }
        }
    }

    fn settle_image(&mut self, id: &ImageId) {
        let Some(sim) = self.images.get_mut(id) else {
            return;
        };
        if sim.image.state != ImageState::Pending {
            return;
        }
        if sim.settle > 0 {
            sim.settle -= 1;
            if sim.settle > 0 {
                return;
            }
        }
        sim.image.state = if sim.fails {
            ImageState::Failed
        } else {
            ImageState::Available
        };
    }

    fn membership(
        &mut self,
        target_groups: bool,
        name: &str,
    ) -> ApiResult<&mut BTreeSet<InstanceId>> {
        let (map, code) = if target_groups {
            (&mut self.target_groups, "TargetGroupNotFound")
        } else {
            (&mut self.load_balancers, "LoadBalancerNotFound")
        };
        map.get_mut(name).ok_or_else(|| {
            CloudApiError::not_found(code, format!("'{name}' could not be found"))
        })
    }

    fn register(&mut self, target_groups: bool, name: &str, id: &InstanceId) -> ApiResult<()> {
        self.live_instance_mut(id)?;
        if self.faults.rejecting_load_balancers.contains(name) {
            return Err(CloudApiError::new(
                CloudErrorKind::InvalidParameter,
                "InvalidTarget",
                format!("'{name}' rejected instance {id}"),
            ));
        }
        self.membership(target_groups, name)?.insert(id.clone());
        Ok(())
    }

    fn check_delete(&self, id: &str) -> ApiResult<()> {
        if self.faults.failing_deletes.contains(id) {
            return Err(CloudApiError::new(
                CloudErrorKind::Internal,
                "InternalError",
                format!("'{id}' could not be deleted"),
            ));
        }
        Ok(())
    }

    fn deregister(&mut self, target_groups: bool, name: &str, id: &InstanceId) -> ApiResult<()> {
        if self.faults.rejecting_deregistrations.contains(name) {
            return Err(CloudApiError::new(
                CloudErrorKind::Internal,
                "InternalFailure",
                format!("'{name}' failed to deregister instance {id}"),
            ));
        }
        if !self.membership(target_groups, name)?.remove(id) {
            return Err(CloudApiError::not_found(
                "InvalidInstance",
                format!("instance {id} is not registered with '{name}'"),
            ));
        }
        Ok(())
    }

    fn members_for(&self, target_groups: bool, id: &InstanceId) -> Vec<String> {
        let map = if target_groups {
            &self.target_groups
        } else {
            &self.load_balancers
        };
        map.iter()
            .filter(|(_, members)| members.contains(id))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// In-memory compute API simulator.
pub struct MemoryCloud {
    state: Mutex<SimState>,
}

impl MemoryCloud {
    /// Create an empty cloud for `region`.
    pub fn new(region: impl Into<String>) -> Self {
        Self::from_state(SimState {
            region: region.into(),
            settle_polls: DEFAULT_SETTLE_POLLS,
            ..SimState::default()
        })
    }

    fn from_state(state: SimState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Set how many describe calls a transition takes to complete.
    pub fn with_settle_polls(self, polls: u32) -> Self {
        self.lock().settle_polls = polls;
        self
    }

    /// Load a previously saved state file.
    pub fn load(path: &Path) -> Result<Self, SimulatorError> {
        let bytes = std::fs::read(path)?;
        let state: SimState = serde_json::from_slice(&bytes)?;
        info!(path = %path.display(), instances = state.instances.len(), "Loaded simulator state");
        Ok(Self::from_state(state))
    }

    /// Persist the current state as JSON.
    pub fn save(&self, path: &Path) -> Result<(), SimulatorError> {
        let json = serde_json::to_vec_pretty(&*self.lock())?;
        std::fs::write(path, json)?;
        debug!(path = %path.display(), "Saved simulator state");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn region(&self) -> String {
        self.lock().region.clone()
    }

    // --- seeding ---

    pub fn add_vpc(&self) -> VpcId {
        let mut state = self.lock();
        VpcId::from_sequence(state.next_seq())
    }

    pub fn add_subnet(&self, vpc: &VpcId, availability_zone: &str) -> SubnetId {
        let mut state = self.lock();
        let id = SubnetId::from_sequence(state.next_seq());
        state.subnets.insert(
            id.clone(),
            Subnet {
                id: id.clone(),
                vpc_id: vpc.clone(),
                availability_zone: availability_zone.to_string(),
            },
        );
        id
    }

    pub fn add_security_group(&self, vpc: &VpcId, name: &str) -> SecurityGroupId {
        let mut state = self.lock();
        let id = SecurityGroupId::from_sequence(state.next_seq());
        state.security_groups.push(SecurityGroup {
            id: id.clone(),
            name: name.to_string(),
            vpc_id: vpc.clone(),
        });
        id
    }

    /// Register an available, unencrypted image backed by one snapshot.
    pub fn add_image(&self, seed: SeedImage) -> ImageId {
        let mut state = self.lock();
        let id = ImageId::from_sequence(state.next_seq());
        let snapshot_id = SnapshotId::from_sequence(state.next_seq());
        let now = Utc::now();
        state.snapshots.insert(
            snapshot_id.clone(),
            Snapshot {
                id: snapshot_id.clone(),
                volume_id: None,
                description: format!("Backing snapshot for {}", seed.name),
                state: SnapshotState::Completed,
                start_time: now,
                tags: Tags::new(),
            },
        );
        state.images.insert(
            id.clone(),
            SimImage {
                image: Image {
                    id: id.clone(),
                    name: seed.name,
                    state: ImageState::Available,
                    root_device_name: seed.root_device_name,
                    root_device_size_gib: seed.root_device_size_gib,
                    encrypted: false,
                    kms_key_id: None,
                    snapshot_ids: vec![snapshot_id],
                    creation_date: now,
                },
                settle: 0,
                fails: false,
            },
        );
        id
    }

    pub fn add_route_table(&self) -> RouteTableId {
        let mut state = self.lock();
        let id = RouteTableId::from_sequence(state.next_seq());
        state.route_tables.insert(
            id.clone(),
            RouteTable {
                id: id.clone(),
                routes: Vec::new(),
            },
        );
        id
    }

    pub fn add_load_balancer(&self, name: &str) {
        self.lock()
            .load_balancers
            .insert(name.to_string(), BTreeSet::new());
    }

    pub fn add_target_group(&self, name: &str) {
        self.lock()
            .target_groups
            .insert(name.to_string(), BTreeSet::new());
    }

    // --- failure injection ---

    /// Answer the next `count` detach calls with `VolumeInUse`.
    pub fn inject_busy_detaches(&self, count: u32) {
        self.lock().faults.busy_detaches = count;
    }

    /// Reject image copies that use `key`.
    pub fn reject_kms_key(&self, key: &str) {
        self.lock().faults.rejected_kms_keys.insert(key.to_string());
    }

    /// Let image copies that use `key` end in `failed`.
    pub fn fail_kms_key(&self, key: &str) {
        self.lock().faults.failing_kms_keys.insert(key.to_string());
    }

    /// Reject every registration with the named load balancer or target group.
    pub fn reject_registrations(&self, name: &str) {
        self.lock()
            .faults
            .rejecting_load_balancers
            .insert(name.to_string());
    }

    /// Fail every deregistration from the named load balancer or target group.
    pub fn reject_deregistrations(&self, name: &str) {
        self.lock()
            .faults
            .rejecting_deregistrations
            .insert(name.to_string());
    }

    /// Fail deletion of the image or snapshot with this id.
    pub fn fail_delete(&self, id: &str) {
        self.lock().faults.failing_deletes.insert(id.to_string());
    }

    // --- inspection (never advances state) ---

    /// Number of times `op` (a [`ComputeApi`] method name) was called.
    pub fn call_count(&self, op: &str) -> u32 {
        self.lock().calls.get(op).copied().unwrap_or(0)
    }

    pub fn instance(&self, id: &InstanceId) -> Option<Instance> {
        self.lock().instances.get(id).map(|s| s.instance.clone())
    }

    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.lock().instances.keys().cloned().collect()
    }

    pub fn volume(&self, id: &VolumeId) -> Option<Volume> {
        self.lock().volumes.get(id).map(|s| s.volume.clone())
    }

    pub fn image(&self, id: &ImageId) -> Option<Image> {
        self.lock().images.get(id).map(|s| s.image.clone())
    }

    pub fn snapshot(&self, id: &SnapshotId) -> Option<Snapshot> {
        self.lock().snapshots.get(id).cloned()
    }

    pub fn route_table(&self, id: &RouteTableId) -> Option<RouteTable> {
        self.lock().route_tables.get(id).cloned()
    }

    pub fn load_balancer_members(&self, name: &str) -> Vec<InstanceId> {
        self.lock()
            .load_balancers
            .get(name)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn target_group_members(&self, name: &str) -> Vec<InstanceId> {
        self.lock()
            .target_groups
            .get(name)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The most recent launch request.
    pub fn last_launch(&self) -> Option<LaunchRequest> {
        self.lock().launches.last().cloned()
    }
}

#[async_trait]
impl ComputeApi for MemoryCloud {
    async fn run_instance(&self, request: &LaunchRequest) -> ApiResult<Instance> {
        let mut state = self.lock();
        state.record("run_instance");
        state.launches.push(request.clone());

        if request.instance_type.is_empty() {
            return Err(CloudApiError::new(
                CloudErrorKind::InvalidParameter,
                "InvalidParameterValue",
                "instance type must not be empty",
            ));
        }

        let image = match state.images.get(&request.image_id) {
            Some(sim) if sim.image.state == ImageState::Available => sim.image.clone(),
            _ => return Err(image_not_found(&request.image_id)),
        };

        let mut subnet_zone = None;
        for nic in &request.network_interfaces {
            let subnet = state.subnets.get(&nic.subnet_id).ok_or_else(|| {
                CloudApiError::not_found(
                    "InvalidSubnetID.NotFound",
                    format!("The subnet ID '{}' does not exist", nic.subnet_id),
                )
            })?;
            subnet_zone.get_or_insert_with(|| subnet.availability_zone.clone());
        }

        let availability_zone = subnet_zone
            .or_else(|| request.availability_zone.clone())
            .unwrap_or_else(|| format!("{}a", state.region));

        let seq = state.next_seq();
        let id = InstanceId::from_sequence(seq);
        let private_ip = request
            .network_interfaces
            .first()
            .and_then(|nic| nic.private_ip)
            .unwrap_or_else(|| Ipv4Addr::new(10, 0, (seq >> 8) as u8, seq as u8));
        let public_ip = request
            .network_interfaces
            .iter()
            .any(|nic| nic.associate_public_ip)
            .then(|| IpAddr::V4(Ipv4Addr::new(54, 0, (seq >> 8) as u8, seq as u8)));

        let mut block_devices = Vec::new();
        for mapping in &request.block_device_mappings {
            let BlockDeviceMapping::Ebs {
                device_name,
                size_gib,
                volume_type,
                iops,
                encrypted,
                kms_key_id,
                delete_on_termination,
            } = mapping
            else {
                continue;
            };
            let volume_id = VolumeId::from_sequence(state.next_seq());
            let volume = Volume {
                id: volume_id.clone(),
                size_gib: *size_gib,
                volume_type: *volume_type,
                iops: *iops,
                encrypted: *encrypted,
                kms_key_id: kms_key_id.clone(),
                availability_zone: availability_zone.clone(),
                state: VolumeState::InUse,
                attachment: Some(VolumeAttachment {
                    instance_id: id.clone(),
                    device: device_name.clone(),
                    state: AttachmentState::Attached,
                    delete_on_termination: *delete_on_termination,
                }),
                tags: Tags::new(),
            };
            state.volumes.insert(
                volume_id.clone(),
                SimVolume {
                    volume,
                    settle: 0,
                    modification: None,
                },
            );
            block_devices.push(AttachedVolume {
                device_name: device_name.clone(),
                volume_id,
            });
        }

        let instance = Instance {
            id: id.clone(),
            state: InstanceState::Pending,
            instance_type: request.instance_type.clone(),
            image_id: request.image_id.clone(),
            availability_zone,
            root_device_name: image.root_device_name,
            private_ip: Some(IpAddr::V4(private_ip)),
            public_ip,
            source_dest_check: true,
            block_devices,
            tags: request.tags.clone(),
        };

        info!(
            instance_id = %id,
            instance_type = %request.instance_type,
            image_id = %request.image_id,
            "[SIM] Launched instance"
        );

        let settle = state.settle_polls;
        state.instances.insert(
            id,
            SimInstance {
                instance: instance.clone(),
                settle,
            },
        );
        Ok(instance)
    }

    async fn describe_instance(&self, id: &InstanceId) -> ApiResult<Option<Instance>> {
        let mut state = self.lock();
        state.record("describe_instance");
        state.settle_instance(id);
        Ok(state.instances.get(id).map(|s| s.instance.clone()))
    }

    async fn terminate_instance(&self, id: &InstanceId) -> ApiResult<()> {
        let mut state = self.lock();
        state.record("terminate_instance");
        let settle = state.settle_polls;
        let sim = state
            .instances
            .get_mut(id)
            .ok_or_else(|| instance_not_found(id))?;
        if sim.instance.state != InstanceState::Terminated {
            sim.instance.state = InstanceState::ShuttingDown;
            sim.settle = settle;
            info!(instance_id = %id, "[SIM] Terminating instance");
        }
        Ok(())
    }

    async fn reboot_instance(&self, id: &InstanceId) -> ApiResult<()> {
        let mut state = self.lock();
        state.record("reboot_instance");
        state.live_instance_mut(id)?;
        info!(instance_id = %id, "[SIM] Rebooting instance");
        Ok(())
    }

    async fn set_source_dest_check(&self, id: &InstanceId, enabled: bool) -> ApiResult<()> {
        let mut state = self.lock();
        state.record("set_source_dest_check");
        state.live_instance_mut(id)?.instance.source_dest_check = enabled;
        Ok(())
    }

    async fn associate_address(&self, id: &InstanceId, public_ip: IpAddr) -> ApiResult<()> {
        let mut state = self.lock();
        state.record("associate_address");
        state.live_instance_mut(id)?.instance.public_ip = Some(public_ip);
        Ok(())
    }

    async fn create_tags(&self, resource_id: &str, tags: &Tags) -> ApiResult<()> {
        let mut state = self.lock();
        state.record("create_tags");

        let target = if let Ok(id) = InstanceId::parse(resource_id) {
            state.instances.get_mut(&id).map(|s| &mut s.instance.tags)
        } else if let Ok(id) = VolumeId::parse(resource_id) {
            state.volumes.get_mut(&id).map(|s| &mut s.volume.tags)
        } else if let Ok(id) = SnapshotId::parse(resource_id) {
            state.snapshots.get_mut(&id).map(|s| &mut s.tags)
        } else {
            None
        };

        let target = target.ok_or_else(|| {
            CloudApiError::not_found(
                "InvalidID",
                format!("The ID '{resource_id}' is not valid"),
            )
        })?;
        target.extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn create_volume(&self, request: &CreateVolumeRequest) -> ApiResult<Volume> {
        let mut state = self.lock();
        state.record("create_volume");

        if request.size_gib == 0 {
            return Err(CloudApiError::new(
                CloudErrorKind::InvalidParameter,
                "InvalidParameterValue",
                "volume size must be at least 1 GiB",
            ));
        }
        if request.volume_type.requires_iops() && request.iops.is_none() {
            return Err(CloudApiError::new(
                CloudErrorKind::InvalidParameter,
                "MissingParameter",
                format!("iops is required for {} volumes", request.volume_type),
            ));
        }

        let id = VolumeId::from_sequence(state.next_seq());
        let volume = Volume {
            id: id.clone(),
            size_gib: request.size_gib,
            volume_type: request.volume_type,
            iops: request.iops,
            encrypted: request.encrypted,
            kms_key_id: request.kms_key_id.clone(),
            availability_zone: request.availability_zone.clone(),
            state: VolumeState::Creating,
            attachment: None,
            tags: request.tags.clone(),
        };
        let settle = state.settle_polls;
        state.volumes.insert(
            id.clone(),
            SimVolume {
                volume: volume.clone(),
                settle,
                modification: None,
            },
        );
        info!(volume_id = %id, size_gib = request.size_gib, "[SIM] Created volume");
        Ok(volume)
    }

    async fn describe_volume(&self, id: &VolumeId) -> ApiResult<Option<Volume>> {
        let mut state = self.lock();
        state.record("describe_volume");
        state.settle_volume(id);
        Ok(state.volumes.get(id).map(|s| s.volume.clone()))
    }

    async fn delete_volume(&self, id: &VolumeId) -> ApiResult<()> {
        let mut state = self.lock();
        state.record("delete_volume");
        let sim = state.volumes.get(id).ok_or_else(|| volume_not_found(id))?;
        if sim.volume.attachment.is_some() {
            return Err(CloudApiError::new(
                CloudErrorKind::InUse,
                "VolumeInUse",
                format!("Volume {id} is currently attached"),
            ));
        }
        state.volumes.remove(id);
        info!(volume_id = %id, "[SIM] Deleted volume");
        Ok(())
    }

    async fn attach_volume(
        &self,
        volume: &VolumeId,
        instance: &InstanceId,
        device: &str,
    ) -> ApiResult<()> {
        let mut state = self.lock();
        state.record("attach_volume");
        let settle = state.settle_polls;

        let owner = state.live_instance_mut(instance)?;
        if owner
            .instance
            .block_devices
            .iter()
            .any(|b| b.device_name == device)
        {
            return Err(CloudApiError::new(
                CloudErrorKind::InvalidParameter,
                "InvalidParameterValue",
                format!("Device {device} is already in use on {instance}"),
            ));
        }
        let zone = owner.instance.availability_zone.clone();

        let sim = state
            .volumes
            .get_mut(volume)
            .ok_or_else(|| volume_not_found(volume))?;
        if sim.volume.state == VolumeState::Creating {
            return Err(CloudApiError::new(
                CloudErrorKind::IncorrectState,
                "IncorrectState",
                format!("Volume {volume} is still being created"),
            ));
        }
        if sim.volume.attachment.is_some() {
            return Err(CloudApiError::new(
                CloudErrorKind::InUse,
                "VolumeInUse",
                format!("{volume} is already attached to an instance"),
            ));
        }
        if sim.volume.availability_zone != zone {
            return Err(CloudApiError::new(
                CloudErrorKind::InvalidParameter,
                "InvalidVolume.ZoneMismatch",
                format!("Volume {volume} is not in the same availability zone as {instance}"),
            ));
        }

        sim.volume.state = VolumeState::InUse;
        sim.volume.attachment = Some(VolumeAttachment {
            instance_id: instance.clone(),
            device: device.to_string(),
            state: AttachmentState::Attaching,
            delete_on_termination: false,
        });
        sim.settle = settle;

        if let Some(owner) = state.instances.get_mut(instance) {
            owner.instance.block_devices.push(AttachedVolume {
                device_name: device.to_string(),
                volume_id: volume.clone(),
            });
        }
        info!(volume_id = %volume, instance_id = %instance, device, "[SIM] Attaching volume");
        Ok(())
    }

    async fn detach_volume(&self, volume: &VolumeId, instance: &InstanceId) -> ApiResult<()> {
        let mut state = self.lock();
        state.record("detach_volume");
        let settle = state.settle_polls;

        if !state.volumes.contains_key(volume) {
            return Err(volume_not_found(volume));
        }
        if state.faults.busy_detaches > 0 {
            state.faults.busy_detaches -= 1;
            return Err(CloudApiError::new(
                CloudErrorKind::InUse,
                "VolumeInUse",
                format!("{volume} is busy"),
            ));
        }

        let sim = state
            .volumes
            .get_mut(volume)
            .ok_or_else(|| volume_not_found(volume))?;
        match sim.volume.attachment.as_mut() {
            Some(attachment) if attachment.instance_id == *instance => {
                attachment.state = AttachmentState::Detaching;
                sim.settle = settle;
            }
            _ => {
                return Err(CloudApiError::new(
                    CloudErrorKind::IncorrectState,
                    "IncorrectState",
                    format!("Volume {volume} is not attached to {instance}"),
                ));
            }
        }
        info!(volume_id = %volume, instance_id = %instance, "[SIM] Detaching volume");
        Ok(())
    }

    async fn modify_volume(&self, id: &VolumeId, size_gib: u64) -> ApiResult<()> {
        let mut state = self.lock();
        state.record("modify_volume");
        let settle = state.settle_polls;
        let sim = state
            .volumes
            .get_mut(id)
            .ok_or_else(|| volume_not_found(id))?;
        if size_gib < sim.volume.size_gib {
            return Err(CloudApiError::new(
                CloudErrorKind::InvalidParameter,
                "InvalidParameterValue",
                format!(
                    "New size {size_gib} GiB is smaller than current size {} GiB",
                    sim.volume.size_gib
                ),
            ));
        }
        sim.modification = Some(SimModification {
            state: ModificationState::Modifying,
            target_size_gib: size_gib,
            settle,
        });
        Ok(())
    }

    async fn describe_volume_modification(
        &self,
        id: &VolumeId,
    ) -> ApiResult<Option<ModificationState>> {
        let mut state = self.lock();
        state.record("describe_volume_modification");
        let sim = state
            .volumes
            .get_mut(id)
            .ok_or_else(|| volume_not_found(id))?;
        let Some(modification) = sim.modification.as_mut() else {
            return Ok(None);
        };
        if modification.state == ModificationState::Modifying {
            modification.settle = modification.settle.saturating_sub(1);
            if modification.settle == 0 {
                modification.state = ModificationState::Completed;
                sim.volume.size_gib = modification.target_size_gib;
            }
        }
        Ok(Some(modification.state))
    }

    async fn create_snapshot(&self, volume: &VolumeId, description: &str) -> ApiResult<Snapshot> {
        let mut state = self.lock();
        state.record("create_snapshot");
        if !state.volumes.contains_key(volume) {
            return Err(volume_not_found(volume));
        }
        let id = SnapshotId::from_sequence(state.next_seq());
        let snapshot = Snapshot {
            id: id.clone(),
            volume_id: Some(volume.clone()),
            description: description.to_string(),
            state: SnapshotState::Completed,
            start_time: Utc::now(),
            tags: Tags::new(),
        };
        state.snapshots.insert(id, snapshot.clone());
        Ok(snapshot)
    }

    async fn delete_snapshot(&self, id: &SnapshotId) -> ApiResult<()> {
        let mut state = self.lock();
        state.record("delete_snapshot");
        state.check_delete(id.as_str())?;
        state.snapshots.remove(id).ok_or_else(|| {
            CloudApiError::not_found(
                "InvalidSnapshot.NotFound",
                format!("The snapshot '{id}' does not exist."),
            )
        })?;
        Ok(())
    }

    async fn describe_image(&self, id: &ImageId) -> ApiResult<Option<Image>> {
        let mut state = self.lock();
        state.record("describe_image");
        state.settle_image(id);
        Ok(state.images.get(id).map(|s| s.image.clone()))
    }

    async fn copy_image(&self, request: &CopyImageRequest) -> ApiResult<ImageId> {
        let mut state = self.lock();
        state.record("copy_image");

        let source = state
            .images
            .get(&request.source_image_id)
            .map(|s| s.image.clone())
            .ok_or_else(|| image_not_found(&request.source_image_id))?;

        let key = request.kms_key_id.as_deref().unwrap_or_default();
        if state.faults.rejected_kms_keys.contains(key) {
            return Err(CloudApiError::new(
                CloudErrorKind::InvalidParameter,
                "InvalidParameterValue",
                format!("Invalid KMS key: {key}"),
            ));
        }
        let fails = state.faults.failing_kms_keys.contains(key);

        let id = ImageId::from_sequence(state.next_seq());
        let snapshot_id = SnapshotId::from_sequence(state.next_seq());
        let now = Utc::now();
        state.snapshots.insert(
            snapshot_id.clone(),
            Snapshot {
                id: snapshot_id.clone(),
                volume_id: None,
                description: format!(
                    "Copied for {id} from {} in {}",
                    request.source_image_id, request.source_region
                ),
                state: SnapshotState::Completed,
                start_time: now,
                tags: Tags::new(),
            },
        );

        let settle = state.settle_polls;
        state.images.insert(
            id.clone(),
            SimImage {
                image: Image {
                    id: id.clone(),
                    name: request.name.clone(),
                    state: ImageState::Pending,
                    root_device_name: source.root_device_name,
                    root_device_size_gib: source.root_device_size_gib,
                    encrypted: request.encrypted,
                    kms_key_id: request.kms_key_id.clone(),
                    snapshot_ids: vec![snapshot_id],
                    creation_date: now,
                },
                settle,
                fails,
            },
        );
        info!(image_id = %id, source = %request.source_image_id, "[SIM] Copying image");
        Ok(id)
    }

    async fn deregister_image(&self, id: &ImageId) -> ApiResult<()> {
        let mut state = self.lock();
        state.record("deregister_image");
        state.check_delete(id.as_str())?;
        state
            .images
            .remove(id)
            .ok_or_else(|| image_not_found(id))?;
        Ok(())
    }

    async fn describe_subnet(&self, id: &SubnetId) -> ApiResult<Option<Subnet>> {
        let mut state = self.lock();
        state.record("describe_subnet");
        Ok(state.subnets.get(id).cloned())
    }

    async fn find_security_groups(
        &self,
        vpc: &VpcId,
        names: &[String],
    ) -> ApiResult<Vec<SecurityGroup>> {
        let mut state = self.lock();
        state.record("find_security_groups");
        Ok(state
            .security_groups
            .iter()
            .filter(|g| g.vpc_id == *vpc && names.contains(&g.name))
            .cloned()
            .collect())
    }

    async fn describe_route_table(&self, id: &RouteTableId) -> ApiResult<Option<RouteTable>> {
        let mut state = self.lock();
        state.record("describe_route_table");
        Ok(state.route_tables.get(id).cloned())
    }

    async fn create_route(
        &self,
        table: &RouteTableId,
        destination_cidr: &str,
        instance: &InstanceId,
    ) -> ApiResult<()> {
        let mut state = self.lock();
        state.record("create_route");
        let table = state.route_tables.get_mut(table).ok_or_else(|| {
            CloudApiError::not_found(
                "InvalidRouteTableID.NotFound",
                format!("The routeTable ID '{table}' does not exist"),
            )
        })?;
        if table
            .routes
            .iter()
            .any(|r| r.destination_cidr == destination_cidr)
        {
            return Err(CloudApiError::new(
                CloudErrorKind::InvalidParameter,
                "RouteAlreadyExists",
                format!("The route identified by {destination_cidr} already exists."),
            ));
        }
        table.routes.push(Route {
            destination_cidr: destination_cidr.to_string(),
            instance_id: Some(instance.clone()),
        });
        Ok(())
    }

    async fn replace_route(
        &self,
        table: &RouteTableId,
        destination_cidr: &str,
        instance: &InstanceId,
    ) -> ApiResult<()> {
        let mut state = self.lock();
        state.record("replace_route");
        let route = state
            .route_tables
            .get_mut(table)
            .and_then(|t| {
                t.routes
                    .iter_mut()
                    .find(|r| r.destination_cidr == destination_cidr)
            })
            .ok_or_else(|| {
                CloudApiError::not_found(
                    "InvalidRoute.NotFound",
                    format!("no route with destination-cidr-block {destination_cidr} in {table}"),
                )
            })?;
        route.instance_id = Some(instance.clone());
        Ok(())
    }

    async fn register_with_load_balancer(
        &self,
        name: &str,
        instance: &InstanceId,
    ) -> ApiResult<()> {
        let mut state = self.lock();
        state.record("register_with_load_balancer");
        state.register(false, name, instance)
    }

    async fn deregister_from_load_balancer(
        &self,
        name: &str,
        instance: &InstanceId,
    ) -> ApiResult<()> {
        let mut state = self.lock();
        state.record("deregister_from_load_balancer");
        state.deregister(false, name, instance)
    }

    async fn load_balancers_for_instance(&self, instance: &InstanceId) -> ApiResult<Vec<String>> {
        let mut state = self.lock();
        state.record("load_balancers_for_instance");
        Ok(state.members_for(false, instance))
    }

    async fn register_target(&self, target_group: &str, instance: &InstanceId) -> ApiResult<()> {
        let mut state = self.lock();
        state.record("register_target");
        state.register(true, target_group, instance)
    }

    async fn deregister_target(&self, target_group: &str, instance: &InstanceId) -> ApiResult<()> {
        let mut state = self.lock();
        state.record("deregister_target");
        state.deregister(true, target_group, instance)
    }

    async fn target_groups_for_instance(&self, instance: &InstanceId) -> ApiResult<Vec<String>> {
        let mut state = self.lock();
        state.record("target_groups_for_instance");
        Ok(state.members_for(true, instance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cloud() -> (MemoryCloud, SubnetId, ImageId) {
        let cloud = MemoryCloud::new("us-east-1");
        let vpc = cloud.add_vpc();
        let subnet = cloud.add_subnet(&vpc, "us-east-1a");
        let image = cloud.add_image(SeedImage::default());
        (cloud, subnet, image)
    }

    fn launch(image: &ImageId, subnet: &SubnetId) -> LaunchRequest {
        LaunchRequest {
            image_id: image.clone(),
            instance_type: "m5.large".to_string(),
            availability_zone: None,
            key_name: None,
            iam_instance_profile: None,
            placement_group: None,
            tenancy: None,
            block_device_mappings: vec![BlockDeviceMapping::Ebs {
                device_name: "/dev/xvda".to_string(),
                size_gib: 8,
                volume_type: DiskType::Gp3,
                iops: None,
                encrypted: false,
                kms_key_id: None,
                delete_on_termination: true,
            }],
            network_interfaces: vec![NetworkInterfaceRequest {
                device_index: 0,
                subnet_id: subnet.clone(),
                private_ip: None,
                ipv6_addresses: Vec::new(),
                security_groups: Vec::new(),
                associate_public_ip: false,
            }],
            tags: Tags::new(),
        }
    }

    #[tokio::test]
    async fn test_instance_settles_to_running() {
        let (cloud, subnet, image) = cloud();
        let instance = cloud.run_instance(&launch(&image, &subnet)).await.unwrap();
        assert_eq!(instance.state, InstanceState::Pending);
        assert_eq!(instance.availability_zone, "us-east-1a");

        let first = cloud.describe_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(first.state, InstanceState::Pending);
        let second = cloud.describe_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(second.state, InstanceState::Running);
    }

    #[tokio::test]
    async fn test_termination_deletes_root_volume() {
        let (cloud, subnet, image) = cloud();
        let cloud = cloud.with_settle_polls(1);
        let instance = cloud.run_instance(&launch(&image, &subnet)).await.unwrap();
        let root = instance.block_devices[0].volume_id.clone();
        assert!(cloud.volume(&root).is_some());

        cloud.terminate_instance(&instance.id).await.unwrap();
        let gone = cloud.describe_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(gone.state, InstanceState::Terminated);
        assert!(cloud.volume(&root).is_none());
    }

    #[tokio::test]
    async fn test_busy_detach_injection() {
        let (cloud, subnet, image) = cloud();
        let cloud = cloud.with_settle_polls(1);
        let instance = cloud.run_instance(&launch(&image, &subnet)).await.unwrap();
        let volume = cloud
            .create_volume(&CreateVolumeRequest {
                size_gib: 1,
                volume_type: DiskType::Gp3,
                iops: None,
                encrypted: false,
                kms_key_id: None,
                availability_zone: "us-east-1a".to_string(),
                tags: Tags::new(),
            })
            .await
            .unwrap();
        cloud.describe_volume(&volume.id).await.unwrap();
        cloud
            .attach_volume(&volume.id, &instance.id, "/dev/sdf")
            .await
            .unwrap();

        cloud.inject_busy_detaches(1);
        let err = cloud
            .detach_volume(&volume.id, &instance.id)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        cloud.detach_volume(&volume.id, &instance.id).await.unwrap();
        assert_eq!(cloud.call_count("detach_volume"), 2);
    }

    #[tokio::test]
    async fn test_state_file_roundtrip() {
        let (cloud, _subnet, image) = cloud();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        cloud.save(&path).unwrap();

        let restored = MemoryCloud::load(&path).unwrap();
        assert_eq!(restored.region(), "us-east-1");
        assert!(restored.image(&image).is_some());
        // Both continue from the saved sequence.
        assert_eq!(restored.add_vpc(), cloud.add_vpc());
    }
}
