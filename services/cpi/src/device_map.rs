//! Block device planning.
//!
//! Computes the launch-time block device mappings for a VM and the device
//! paths the agent should use, from the image, the VM's cloud properties and
//! its instance type. Pure: no remote calls.
//!
//! Layout:
//! - root: the image's root device, resized and retyped on request
//! - ephemeral: an EBS volume at `/dev/sdb`, or the first instance store
//! - raw ephemeral: every instance store, exposed unformatted to the agent

use crate::cloud::{BlockDeviceMapping, DiskType, Image};
use crate::encryption::EncryptionPolicy;
use crate::error::{CpiError, CpiResult};
use crate::instance_types::{InstanceStorage, InstanceTypeInfo};
use crate::properties::{mib_to_gib, VmCloudProperties, DEFAULT_EPHEMERAL_DISK_GIB};

/// Device the ephemeral disk is mapped to.
pub const EPHEMERAL_DEVICE: &str = "/dev/sdb";

/// Resolved encryption for the VM's own volumes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskEncryption {
    pub root: EncryptionPolicy,
    pub ephemeral: EncryptionPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMapPlan {
    pub root: BlockDeviceMapping,
    /// EBS ephemeral volume, absent when instance storage is used instead.
    pub ephemeral: Option<BlockDeviceMapping>,
    /// Instance-store mappings (legacy families only).
    pub instance_stores: Vec<BlockDeviceMapping>,
    /// Ephemeral device path reported to the agent.
    pub agent_ephemeral: Option<String>,
    /// Raw instance-store paths reported to the agent.
    pub raw_ephemeral: Vec<String>,
}

impl DeviceMapPlan {
    /// All mappings, root first.
    pub fn block_device_mappings(&self) -> Vec<BlockDeviceMapping> {
        std::iter::once(self.root.clone())
            .chain(self.ephemeral.clone())
            .chain(self.instance_stores.iter().cloned())
            .collect()
    }

    pub fn system_device(&self) -> &str {
        self.root.device_name()
    }
}

fn required_iops(disk_type: DiskType, iops: Option<u32>, block: &str) -> CpiResult<Option<u32>> {
    if !disk_type.requires_iops() {
        return Ok(None);
    }
    iops.map(Some).ok_or_else(|| {
        CpiError::validation(format!(
            "Must specify an 'iops' value when the {block} type is '{disk_type}'"
        ))
    })
}

/// Legacy instance-store device for store `index`: `/dev/xvdba`, `/dev/xvdbb`, ...
fn legacy_raw_device(index: u32) -> String {
    let suffix = char::from(b'a' + (index % 26) as u8);
    format!("/dev/xvdb{suffix}")
}

fn nvme_device(index: u32) -> String {
    format!("/dev/nvme{}n1", index + 1)
}

fn require_storage<'a>(
    instance_type: &'a InstanceTypeInfo,
    option: &str,
) -> CpiResult<&'a InstanceStorage> {
    instance_type.instance_storage.as_ref().ok_or_else(|| {
        CpiError::validation(format!(
            "{option} requested but instance type '{}' has no instance storage",
            instance_type.name
        ))
    })
}

/// Compute the device layout for a VM.
pub fn plan(
    image: &Image,
    props: &VmCloudProperties,
    instance_type: &InstanceTypeInfo,
    encryption: &DiskEncryption,
) -> CpiResult<DeviceMapPlan> {
    // Root
    let root_size = match props.root_disk.size {
        Some(size) => {
            let gib = mib_to_gib(size);
            if gib < image.root_device_size_gib {
                return Err(CpiError::validation(format!(
                    "root_disk.size {gib} GiB is smaller than the image's root device ({} GiB)",
                    image.root_device_size_gib
                )));
            }
            gib
        }
        None => image.root_device_size_gib,
    };
    let root_type = props.root_disk.disk_type.unwrap_or_default();
    let root = BlockDeviceMapping::Ebs {
        device_name: image.root_device_name.clone(),
        size_gib: root_size,
        volume_type: root_type,
        iops: required_iops(root_type, props.root_disk.iops, "root_disk")?,
        encrypted: encryption.root.encrypted,
        kms_key_id: encryption.root.key_ref.clone(),
        delete_on_termination: true,
    };

    let ephemeral_props = &props.ephemeral_disk;
    if props.raw_instance_storage && ephemeral_props.use_instance_storage {
        return Err(CpiError::validation(
            "ephemeral_disk.use_instance_storage and raw_instance_storage cannot both be set",
        ));
    }

    let mut instance_stores = Vec::new();

    // Ephemeral
    let (ephemeral, agent_ephemeral) = if ephemeral_props.use_instance_storage {
        let storage = require_storage(instance_type, "ephemeral_disk.use_instance_storage")?;
        if storage.nvme {
            (None, nvme_device(0))
        } else {
            instance_stores.push(BlockDeviceMapping::InstanceStore {
                device_name: EPHEMERAL_DEVICE.to_string(),
                virtual_name: "ephemeral0".to_string(),
            });
            (None, EPHEMERAL_DEVICE.to_string())
        }
    } else {
        let disk_type = ephemeral_props.disk_type.unwrap_or_default();
        let mapping = BlockDeviceMapping::Ebs {
            device_name: EPHEMERAL_DEVICE.to_string(),
            size_gib: ephemeral_props
                .size
                .map(mib_to_gib)
                .unwrap_or(DEFAULT_EPHEMERAL_DISK_GIB),
            volume_type: disk_type,
            iops: required_iops(disk_type, ephemeral_props.iops, "ephemeral_disk")?,
            encrypted: encryption.ephemeral.encrypted,
            kms_key_id: encryption.ephemeral.key_ref.clone(),
            delete_on_termination: true,
        };
        (Some(mapping), EPHEMERAL_DEVICE.to_string())
    };

    // Raw ephemeral
    let mut raw_ephemeral = Vec::new();
    if props.raw_instance_storage {
        let storage = require_storage(instance_type, "raw_instance_storage")?;
        for index in 0..storage.count {
            if storage.nvme {
                raw_ephemeral.push(nvme_device(index));
            } else {
                let device = legacy_raw_device(index);
                instance_stores.push(BlockDeviceMapping::InstanceStore {
                    device_name: device.clone(),
                    virtual_name: format!("ephemeral{index}"),
                });
                raw_ephemeral.push(device);
            }
        }
    }

    Ok(DeviceMapPlan {
        root,
        ephemeral,
        instance_stores,
        agent_ephemeral: Some(agent_ephemeral),
        raw_ephemeral,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use cpi_id::ImageId;
    use rstest::rstest;

    use super::*;
    use crate::cloud::ImageState;
    use crate::instance_types;
    use crate::properties::{EphemeralDisk, RootDisk};

    fn image() -> Image {
        Image {
            id: ImageId::from_sequence(1),
            name: "stemcell".to_string(),
            state: ImageState::Available,
            root_device_name: "/dev/xvda".to_string(),
            root_device_size_gib: 3,
            encrypted: false,
            kms_key_id: None,
            snapshot_ids: Vec::new(),
            creation_date: Utc::now(),
        }
    }

    fn ebs_fields(mapping: &BlockDeviceMapping) -> (u64, DiskType, Option<u32>, bool) {
        match mapping {
            BlockDeviceMapping::Ebs {
                size_gib,
                volume_type,
                iops,
                encrypted,
                ..
            } => (*size_gib, *volume_type, *iops, *encrypted),
            other => panic!("expected EBS mapping, got {other:?}"),
        }
    }

    #[test]
    fn test_defaults() {
        let props = VmCloudProperties::default();
        let plan = plan(
            &image(),
            &props,
            &instance_types::resolve("m5.large"),
            &DiskEncryption::default(),
        )
        .unwrap();

        assert_eq!(plan.system_device(), "/dev/xvda");
        assert_eq!(ebs_fields(&plan.root), (3, DiskType::Gp3, None, false));
        let ephemeral = plan.ephemeral.as_ref().unwrap();
        assert_eq!(ephemeral.device_name(), "/dev/sdb");
        assert_eq!(ebs_fields(ephemeral), (10, DiskType::Gp3, None, false));
        assert_eq!(plan.agent_ephemeral.as_deref(), Some("/dev/sdb"));
        assert!(plan.raw_ephemeral.is_empty());
        assert_eq!(plan.block_device_mappings().len(), 2);
    }

    #[test]
    fn test_sizes_types_and_encryption() {
        let props = VmCloudProperties {
            root_disk: RootDisk {
                size: Some(20 * 1024),
                disk_type: Some(DiskType::Gp2),
                ..Default::default()
            },
            ephemeral_disk: EphemeralDisk {
                size: Some(4097),
                disk_type: Some(DiskType::Io1),
                iops: Some(1000),
                ..Default::default()
            },
            ..Default::default()
        };
        let encryption = DiskEncryption {
            root: EncryptionPolicy::default(),
            ephemeral: EncryptionPolicy {
                encrypted: true,
                key_ref: Some("key".to_string()),
            },
        };
        let plan = plan(
            &image(),
            &props,
            &instance_types::resolve("m5.large"),
            &encryption,
        )
        .unwrap();

        assert_eq!(ebs_fields(&plan.root), (20, DiskType::Gp2, None, false));
        assert_eq!(
            ebs_fields(plan.ephemeral.as_ref().unwrap()),
            (5, DiskType::Io1, Some(1000), true)
        );
    }

    #[test]
    fn test_io_type_requires_iops() {
        let props = VmCloudProperties {
            ephemeral_disk: EphemeralDisk {
                disk_type: Some(DiskType::Io2),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = plan(
            &image(),
            &props,
            &instance_types::resolve("m5.large"),
            &DiskEncryption::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("'iops'"));
    }

    #[test]
    fn test_root_smaller_than_image_rejected() {
        let props = VmCloudProperties {
            root_disk: RootDisk {
                size: Some(1024),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(plan(
            &image(),
            &props,
            &instance_types::resolve("m5.large"),
            &DiskEncryption::default()
        )
        .is_err());
    }

    #[rstest]
    #[case("m3.medium", None, Some("/dev/sdb"), 1)]
    #[case("i3.large", None, Some("/dev/nvme1n1"), 0)]
    fn test_use_instance_storage(
        #[case] instance_type: &str,
        #[case] ebs_ephemeral: Option<&str>,
        #[case] agent_device: Option<&str>,
        #[case] store_mappings: usize,
    ) {
        let props = VmCloudProperties {
            ephemeral_disk: EphemeralDisk {
                use_instance_storage: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let plan = plan(
            &image(),
            &props,
            &instance_types::resolve(instance_type),
            &DiskEncryption::default(),
        )
        .unwrap();

        assert_eq!(
            plan.ephemeral.as_ref().map(|m| m.device_name()),
            ebs_ephemeral
        );
        assert_eq!(plan.agent_ephemeral.as_deref(), agent_device);
        assert_eq!(plan.instance_stores.len(), store_mappings);
    }

    #[test]
    fn test_raw_instance_storage_legacy() {
        let props = VmCloudProperties {
            raw_instance_storage: true,
            ..Default::default()
        };
        let plan = plan(
            &image(),
            &props,
            &instance_types::resolve("m3.xlarge"),
            &DiskEncryption::default(),
        )
        .unwrap();

        assert_eq!(plan.raw_ephemeral, vec!["/dev/xvdba", "/dev/xvdbb"]);
        assert_eq!(
            plan.instance_stores,
            vec![
                BlockDeviceMapping::InstanceStore {
                    device_name: "/dev/xvdba".to_string(),
                    virtual_name: "ephemeral0".to_string(),
                },
                BlockDeviceMapping::InstanceStore {
                    device_name: "/dev/xvdbb".to_string(),
                    virtual_name: "ephemeral1".to_string(),
                },
            ]
        );
        // The EBS ephemeral disk is still present.
        assert!(plan.ephemeral.is_some());
    }

    #[test]
    fn test_raw_instance_storage_nvme() {
        let props = VmCloudProperties {
            raw_instance_storage: true,
            ..Default::default()
        };
        let plan = plan(
            &image(),
            &props,
            &instance_types::resolve("i3.large"),
            &DiskEncryption::default(),
        )
        .unwrap();

        assert_eq!(plan.raw_ephemeral, vec!["/dev/nvme1n1"]);
        assert!(plan.instance_stores.is_empty());
    }

    #[test]
    fn test_raw_instance_storage_errors() {
        let without_storage = VmCloudProperties {
            raw_instance_storage: true,
            ..Default::default()
        };
        let err = plan(
            &image(),
            &without_storage,
            &instance_types::resolve("m5.large"),
            &DiskEncryption::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("no instance storage"));

        let both = VmCloudProperties {
            raw_instance_storage: true,
            ephemeral_disk: EphemeralDisk {
                use_instance_storage: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = plan(
            &image(),
            &both,
            &instance_types::resolve("m3.xlarge"),
            &DiskEncryption::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("cannot both be set"));
    }
}
