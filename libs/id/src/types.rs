//! Typed ID definitions for all provider resources.
//!
//! Each ID type has a unique prefix that identifies the resource type.

use crate::define_id;

// =============================================================================
// Compute
// =============================================================================

define_id!(InstanceId, "i");
define_id!(ImageId, "ami");

// =============================================================================
// Storage
// =============================================================================

define_id!(VolumeId, "vol");
define_id!(SnapshotId, "snap");

// =============================================================================
// Networking
// =============================================================================

define_id!(VpcId, "vpc");
define_id!(SubnetId, "subnet");
define_id!(SecurityGroupId, "sg");
define_id!(RouteTableId, "rtb");

// =============================================================================
// Tests
// =============================================================================
