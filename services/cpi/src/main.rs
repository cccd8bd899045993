//! cpi - cloud provider interface executable
//!
//! Reads one JSON request (from `--request` or stdin), runs it against the
//! configured compute backend and prints the JSON response on stdout.
//! Diagnostics go to stderr.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use cpi::cloud::{MemoryCloud, SeedImage};
use cpi::config::Config;
use cpi::registry::{HttpRegistry, MemoryRegistry, Registry};
use cpi::{logging, Cpi, Request};

/// Describe calls per transition for a freshly seeded simulator.
const CLI_SETTLE_POLLS: u32 = 1;

#[derive(Parser, Debug)]
#[command(name = "cpi")]
#[command(about = "Cloud provider interface for VM, disk and stemcell lifecycle", long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(env = "CPI_CONFIG")]
    config: PathBuf,

    /// Read the request from this file instead of stdin
    #[arg(short, long)]
    request: Option<PathBuf>,

    /// Emit stderr logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Copy request logs to stderr as well as the response
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.log_json);

    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    let request = read_request(args.request.as_deref())?;

    let cloud = Arc::new(open_simulator(&config)?);
    let registry: Arc<dyn Registry> = match &config.registry {
        Some(registry) => Arc::new(
            HttpRegistry::new(&registry.endpoint, &registry.user, &registry.password)
                .context("failed to build registry client")?,
        ),
        None => Arc::new(MemoryRegistry::new()),
    };

    let state_file = config.simulator.state_file.clone();
    let mut cpi = Cpi::new(config, cloud.clone(), registry);
    if args.verbose {
        cpi = cpi.with_stderr_echo();
    }

    let response = cpi.dispatch(request).await;

    if let Some(path) = &state_file {
        cloud
            .save(path)
            .with_context(|| format!("failed to save simulator state to {}", path.display()))?;
    }

    println!("{}", serde_json::to_string(&response)?);
    Ok(())
}

fn read_request(path: Option<&Path>) -> Result<Request> {
    let raw = match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read request from {}", path.display()))?,
        None => {
            let mut raw = String::new();
            std::io::stdin()
                .read_to_string(&mut raw)
                .context("failed to read request from stdin")?;
            raw
        }
    };
    serde_json::from_str(&raw).context("invalid request JSON")
}

/// Load the simulator from its state file, or seed a fresh one.
fn open_simulator(config: &Config) -> Result<MemoryCloud> {
    if let Some(path) = &config.simulator.state_file {
        if path.exists() {
            return MemoryCloud::load(path)
                .with_context(|| format!("failed to load simulator state from {}", path.display()));
        }
    }

    let cloud = MemoryCloud::new(config.cloud.region.clone())
        .with_settle_polls(config.simulator.settle_polls.unwrap_or(CLI_SETTLE_POLLS));
    let vpc = cloud.add_vpc();
    let subnet = cloud.add_subnet(&vpc, &config.cloud.default_zone());
    let group = cloud.add_security_group(&vpc, "default");
    let image = cloud.add_image(SeedImage::default());
    info!(
        region = %cloud.region(),
        vpc_id = %vpc,
        subnet_id = %subnet,
        security_group_id = %group,
        image_id = %image,
        "Seeded compute simulator"
    );
    Ok(cloud)
}
