//! Cloud provider interface library.
//!
//! Turns orchestrator lifecycle requests (stemcells, VMs, persistent disks,
//! snapshots) into sequences of compute API calls, waiting for each remote
//! resource to settle before moving on.
//!
//! ## Architecture
//!
//! ```text
//! Cpi (dispatch)
//! ├── StemcellManager
//! ├── VmManager ── NetworkConfigurator, device_map
//! └── DiskManager
//!         │
//!   CloudContext ── ComputeApi (MemoryCloud)
//!                └─ Registry (HttpRegistry, MemoryRegistry)
//! ```
//!
//! ## Modules
//!
//! - `cloud`: compute API trait, resource types and the in-memory simulator
//! - `registry`: agent settings store
//! - `device_map`: pure block device planning
//! - `dispatch`: request/response envelope and method table

pub mod cloud;
pub mod config;
pub mod context;
pub mod device_map;
pub mod disk;
pub mod dispatch;
pub mod encryption;
pub mod error;
pub mod instance_types;
pub mod logging;
pub mod metadata;
pub mod network;
pub mod properties;
pub mod registry;
pub mod settings;
pub mod sizing;
pub mod stemcell;
pub mod vm;

pub use config::Config;
pub use dispatch::{Cpi, Request, Response, ResponseError};
pub use error::{CpiError, CpiResult, ErrorType};
pub use stemcell::Stemcell;
