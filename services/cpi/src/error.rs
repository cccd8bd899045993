//! Error types for CPI operations.
//!
//! Every failure a method can surface maps onto a closed set of boundary
//! error types ([`ErrorType`]) plus an `ok_to_retry` hint for the caller.

use cpi_id::IdError;
use cpi_retry::WaitError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cloud::{CloudApiError, CloudErrorKind};
use crate::registry::RegistryError;

/// Error type names reported at the command boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorType {
    Unknown,
    #[serde(rename = "VMNotFound")]
    VmNotFound,
    DiskNotFound,
    DiskNotAttached,
    CloudError,
}

/// Top-level error for CPI operations.
#[derive(Debug, Error)]
pub enum CpiError {
    /// Request arguments or cloud properties were rejected.
    #[error("{0}")]
    Validation(String),

    #[error("VM `{0}' not found")]
    VmNotFound(String),

    #[error("Disk `{0}' not found")]
    DiskNotFound(String),

    #[error("Disk `{disk}' is not attached to VM `{vm}'")]
    DiskNotAttached { vm: String, disk: String },

    /// The cloud refused or failed an operation.
    #[error("{0}")]
    Cloud(String),

    #[error(transparent)]
    Api(#[from] CloudApiError),

    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("timed out after {attempts} attempts waiting for {resource} to become {target}")]
    Timeout {
        resource: String,
        target: String,
        attempts: u32,
    },
}

/// Result type for CPI operations.
pub type CpiResult<T> = Result<T, CpiError>;

impl CpiError {
    pub fn validation(message: impl Into<String>) -> Self {
        CpiError::Validation(message.into())
    }

    pub fn cloud(message: impl Into<String>) -> Self {
        CpiError::Cloud(message.into())
    }

    /// The boundary error type for this error.
    pub fn error_type(&self) -> ErrorType {
        match self {
            CpiError::Validation(_) => ErrorType::Unknown,
            CpiError::VmNotFound(_) => ErrorType::VmNotFound,
            CpiError::DiskNotFound(_) => ErrorType::DiskNotFound,
            CpiError::DiskNotAttached { .. } => ErrorType::DiskNotAttached,
            CpiError::Api(err) if err.kind == CloudErrorKind::AuthFailure => ErrorType::Unknown,
            CpiError::Cloud(_)
            | CpiError::Api(_)
            | CpiError::Registry(_)
            | CpiError::Timeout { .. } => ErrorType::CloudError,
        }
    }

    /// Whether the caller may re-issue the same request.
    pub fn ok_to_retry(&self) -> bool {
        match self {
            CpiError::DiskNotAttached { .. } | CpiError::Timeout { .. } => true,
            CpiError::Api(err) => err.is_transient(),
            _ => false,
        }
    }
}

impl From<IdError> for CpiError {
    fn from(err: IdError) -> Self {
        CpiError::Validation(format!("invalid identifier: {err}"))
    }
}

impl From<WaitError<CloudApiError>> for CpiError {
    fn from(err: WaitError<CloudApiError>) -> Self {
        match err {
            WaitError::Timeout {
                resource,
                target,
                attempts,
            } => CpiError::Timeout {
                resource,
                target,
                attempts,
            },
            WaitError::Poll(err) => CpiError::Api(err),
        }
    }
}
