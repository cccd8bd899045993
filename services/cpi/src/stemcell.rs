//! Stemcell (machine image) lifecycle.
//!
//! A stemcell is either a reference to an existing public image (a "light"
//! stemcell, never copied or deleted) or an encrypted copy owned by this
//! CPI. On the wire the two are distinguished by a `" light"` suffix.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use cpi_id::{IdError, ImageId};
use cpi_retry::await_state;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{info, warn};

use crate::cloud::{CopyImageRequest, ImageState};
use crate::context::CloudContext;
use crate::encryption::{self, EncryptionLayer};
use crate::error::{CpiError, CpiResult};
use crate::properties::StemcellProperties;

const LIGHT_SUFFIX: &str = " light";

/// A stemcell handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Stemcell {
    /// A source image used as-is.
    Referenced(ImageId),
    /// An image copied (and encrypted) for this CPI.
    OwnedCopy(ImageId),
}

impl Stemcell {
    /// The image VMs are launched from.
    pub fn image_id(&self) -> &ImageId {
        match self {
            Stemcell::Referenced(id) | Stemcell::OwnedCopy(id) => id,
        }
    }
}

impl fmt::Display for Stemcell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stemcell::Referenced(id) => write!(f, "{id}{LIGHT_SUFFIX}"),
            Stemcell::OwnedCopy(id) => write!(f, "{id}"),
        }
    }
}

impl FromStr for Stemcell {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_suffix(LIGHT_SUFFIX) {
            Some(id) => Ok(Stemcell::Referenced(id.parse()?)),
            None => Ok(Stemcell::OwnedCopy(s.parse()?)),
        }
    }
}

impl Serialize for Stemcell {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Stemcell {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Creates and deletes stemcells.
#[derive(Clone)]
pub struct StemcellManager {
    ctx: Arc<CloudContext>,
}

impl StemcellManager {
    pub fn new(ctx: Arc<CloudContext>) -> Self {
        Self { ctx }
    }

    /// Register a stemcell from its manifest properties.
    ///
    /// Only light stemcells (an `ami` map) are supported; `image_path` is
    /// logged for diagnostics.
    pub async fn create_stemcell(
        &self,
        image_path: &str,
        props: &StemcellProperties,
    ) -> CpiResult<Stemcell> {
        let region = &self.ctx.config.cloud.region;

        if props.ami.is_empty() {
            return Err(CpiError::validation(format!(
                "Cannot create stemcell from image '{image_path}': cloud properties must include 'ami'"
            )));
        }
        let source: ImageId = props
            .ami
            .get(region)
            .ok_or_else(|| {
                CpiError::validation(format!(
                    "Stemcell does not contain an AMI for region '{region}'"
                ))
            })?
            .parse()?;

        let source_image = self
            .ctx
            .retry("describe_image", || self.ctx.compute.describe_image(&source))
            .await?
            .ok_or_else(|| {
                CpiError::validation(format!("Source image {source} not found in {region}"))
            })?;

        let policy = encryption::resolve(
            &self.ctx.config.cloud.encryption(),
            &EncryptionLayer::default(),
            &props.encryption(),
        );

        if !policy.encrypted {
            info!(image_id = %source, "Using light stemcell");
            return Ok(Stemcell::Referenced(source));
        }

        let request = CopyImageRequest {
            source_image_id: source.clone(),
            source_region: region.clone(),
            name: format!(
                "{} encrypted {}",
                source_image.name,
                Utc::now().format("%Y%m%dT%H%M%SZ")
            ),
            encrypted: true,
            kms_key_id: policy.key_ref,
        };

        let copy = self
            .ctx
            .retry("copy_image", || self.ctx.compute.copy_image(&request))
            .await
            .map_err(|e| CpiError::cloud(format!("Failed to copy image {source}: {e}")))?;
        info!(source = %source, image_id = %copy, kms_key = ?request.kms_key_id, "Copying stemcell image");

        let image = await_state(
            copy.as_str(),
            "available",
            &self.ctx.retry,
            || self.ctx.compute.describe_image(&copy),
            |image| image.as_ref().is_some_and(|i| i.state != ImageState::Pending),
        )
        .await?;

        if image.is_some_and(|i| i.state == ImageState::Failed) {
            if let Err(err) = self.ctx.compute.deregister_image(&copy).await {
                warn!(image_id = %copy, error = %err, "Failed to clean up failed image copy");
            }
            return Err(CpiError::cloud(format!(
                "Copying image {source} to {copy} failed"
            )));
        }

        Ok(Stemcell::OwnedCopy(copy))
    }

    /// Delete a stemcell. Light stemcells and missing images are a no-op.
    pub async fn delete_stemcell(&self, stemcell: &Stemcell) -> CpiResult<()> {
        let id = match stemcell {
            Stemcell::Referenced(id) => {
                info!(image_id = %id, "Light stemcell, nothing to delete");
                return Ok(());
            }
            Stemcell::OwnedCopy(id) => id,
        };

        let Some(image) = self
            .ctx
            .retry("describe_image", || self.ctx.compute.describe_image(id))
            .await?
        else {
            info!(image_id = %id, "Image not found, nothing to delete");
            return Ok(());
        };

        match self
            .ctx
            .retry("deregister_image", || self.ctx.compute.deregister_image(id))
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                return Err(CpiError::cloud(format!(
                    "Failed to deregister image {id}: {err}"
                )))
            }
        }

        for snapshot in &image.snapshot_ids {
            match self
                .ctx
                .retry("delete_snapshot", || {
                    self.ctx.compute.delete_snapshot(snapshot)
                })
                .await
            {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    return Err(CpiError::cloud(format!(
                        "Failed to delete snapshot {snapshot} of image {id}: {err}"
                    )))
                }
            }
        }

        info!(image_id = %id, snapshots = image.snapshot_ids.len(), "Deleted stemcell");
        Ok(())
    }
}
