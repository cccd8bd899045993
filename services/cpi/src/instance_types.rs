//! Instance type catalogue.

use std::borrow::Cow;

/// Local instance-store volumes that come with an instance type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceStorage {
    pub count: u32,
    pub size_gib: u64,
    /// NVMe instance stores are exposed directly and need no mapping.
    pub nvme: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceTypeInfo {
    pub name: Cow<'static, str>,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub instance_storage: Option<InstanceStorage>,
}

const fn ebs_only(name: &'static str, vcpus: u32, memory_mib: u64) -> InstanceTypeInfo {
    InstanceTypeInfo {
        name: Cow::Borrowed(name),
        vcpus,
        memory_mib,
        instance_storage: None,
    }
}

const fn with_storage(
    name: &'static str,
    vcpus: u32,
    memory_mib: u64,
    count: u32,
    size_gib: u64,
    nvme: bool,
) -> InstanceTypeInfo {
    InstanceTypeInfo {
        name: Cow::Borrowed(name),
        vcpus,
        memory_mib,
        instance_storage: Some(InstanceStorage {
            count,
            size_gib,
            nvme,
        }),
    }
}

static CATALOGUE: &[InstanceTypeInfo] = &[
    // Burstable
    ebs_only("t3.micro", 2, 1024),
    ebs_only("t3.small", 2, 2048),
    ebs_only("t3.medium", 2, 4096),
    ebs_only("t3.large", 2, 8192),
    ebs_only("t3.xlarge", 4, 16384),
    ebs_only("t3.2xlarge", 8, 32768),
    // General purpose
    ebs_only("m5.large", 2, 8192),
    ebs_only("m5.xlarge", 4, 16384),
    ebs_only("m5.2xlarge", 8, 32768),
    ebs_only("m5.4xlarge", 16, 65536),
    // Compute optimized
    ebs_only("c5.large", 2, 4096),
    ebs_only("c5.xlarge", 4, 8192),
    ebs_only("c5.2xlarge", 8, 16384),
    ebs_only("c5.4xlarge", 16, 32768),
    // Memory optimized
    ebs_only("r5.large", 2, 16384),
    ebs_only("r5.xlarge", 4, 32768),
    ebs_only("r5.2xlarge", 8, 65536),
    // Previous generation with SSD instance stores
    with_storage("m3.medium", 1, 3840, 1, 4, false),
    with_storage("m3.large", 2, 7680, 1, 32, false),
    with_storage("m3.xlarge", 4, 15360, 2, 40, false),
    with_storage("c3.large", 2, 3840, 2, 16, false),
    with_storage("c3.xlarge", 4, 7680, 2, 40, false),
    // NVMe instance stores
    with_storage("i3.large", 2, 15616, 1, 475, true),
    with_storage("i3.xlarge", 4, 31232, 1, 950, true),
    with_storage("i3.2xlarge", 8, 62464, 1, 1900, true),
    with_storage("m5d.large", 2, 8192, 1, 75, true),
    with_storage("m5d.xlarge", 4, 16384, 1, 150, true),
    with_storage("c5d.large", 2, 4096, 1, 50, true),
    with_storage("c5d.2xlarge", 8, 16384, 1, 200, true),
];

/// All known instance types, in catalogue order.
pub fn catalogue() -> &'static [InstanceTypeInfo] {
    CATALOGUE
}

pub fn lookup(name: &str) -> Option<&'static InstanceTypeInfo> {
    CATALOGUE.iter().find(|t| t.name == name)
}

/// Look up `name`, treating unknown types as EBS-only.
pub fn resolve(name: &str) -> InstanceTypeInfo {
    lookup(name).cloned().unwrap_or_else(|| InstanceTypeInfo {
        name: Cow::Owned(name.to_string()),
        vcpus: 0,
        memory_mib: 0,
        instance_storage: None,
    })
}

/// Smallest catalogue entry with at least `vcpus` and `memory_mib`.
///
/// Entries are compared by memory, then vCPUs; ties keep catalogue order.
pub fn smallest_fitting(vcpus: u32, memory_mib: u64) -> Option<&'static InstanceTypeInfo> {
    CATALOGUE
        .iter()
        .filter(|t| t.vcpus >= vcpus && t.memory_mib >= memory_mib)
        .min_by_key(|t| (t.memory_mib, t.vcpus))
}
