//! Configuration for the CPI.
//!
//! Loaded from a YAML file, with `CPI_`-prefixed environment variables
//! overriding individual keys (`CPI_CLOUD__REGION=eu-west-1`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{ConfigError, Environment, File, FileFormat};
use cpi_retry::RetryPolicy;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::cloud::Tags;
use crate::encryption::EncryptionLayer;

/// Top-level CPI configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub cloud: CloudConfig,

    /// Settings registry. Without one, settings are kept in memory.
    #[serde(default)]
    pub registry: Option<RegistryConfig>,

    /// Agent configuration merged into every settings document.
    #[serde(default)]
    pub agent: Map<String, Value>,

    #[serde(default)]
    pub simulator: SimulatorConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloudConfig {
    pub region: String,

    /// Zone for disks created without a VM.
    #[serde(default)]
    pub default_availability_zone: Option<String>,

    #[serde(default)]
    pub default_key_name: Option<String>,

    #[serde(default)]
    pub default_security_groups: Vec<String>,

    #[serde(default)]
    pub default_iam_instance_profile: Option<String>,

    /// Global encryption default for volumes and images.
    #[serde(default)]
    pub encrypted: Option<bool>,

    #[serde(default)]
    pub kms_key_arn: Option<String>,

    /// Tag key that carries the director identity.
    #[serde(default = "default_director_tag_key")]
    pub director_tag_key: String,

    /// Tags applied to every VM and disk.
    #[serde(default)]
    pub default_tags: Tags,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_director_tag_key() -> String {
    "director".to_string()
}

impl CloudConfig {
    /// Config for `region` with every optional setting at its default.
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            default_availability_zone: None,
            default_key_name: None,
            default_security_groups: Vec::new(),
            default_iam_instance_profile: None,
            encrypted: None,
            kms_key_arn: None,
            director_tag_key: default_director_tag_key(),
            default_tags: Tags::new(),
            retry: RetryConfig::default(),
        }
    }

    /// Zone used when nothing else determines placement.
    pub fn default_zone(&self) -> String {
        self.default_availability_zone
            .clone()
            .unwrap_or_else(|| format!("{}a", self.region))
    }

    /// The global encryption layer.
    pub fn encryption(&self) -> EncryptionLayer {
        EncryptionLayer::new(self.encrypted, self.kms_key_arn.clone())
    }
}

/// Retry budget for remote calls.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base.as_millis() as u64,
            max_delay_secs: policy.max.as_secs(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_secs(self.max_delay_secs),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    pub endpoint: String,
    pub user: String,
    pub password: String,
}

/// Options for the built-in compute simulator.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Where simulator state is persisted between invocations.
    pub state_file: Option<PathBuf>,
    /// Describe calls per state transition.
    pub settle_polls: Option<u32>,
}

impl Config {
    pub fn new(cloud: CloudConfig) -> Self {
        Self {
            cloud,
            registry: None,
            agent: Map::new(),
            simulator: SimulatorConfig::default(),
        }
    }

    /// Load from a YAML file plus `CPI_` environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        config::Config::builder()
            .add_source(File::from(path).format(FileFormat::Yaml))
            .add_source(
                Environment::with_prefix("CPI")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
