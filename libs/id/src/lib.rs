//! # cpi-id
//!
//! Typed identifiers for the resources a compute provider assigns.
//!
//! ## Design Principles
//!
//! - IDs are opaque and provider-generated; this crate never invents meaning
//!   beyond the resource-type prefix
//! - All IDs have a canonical string representation with strict parsing
//! - IDs support roundtrip serialization (parse → format → parse)
//! - IDs are typed so a volume ID can never be passed where an instance ID
//!   is expected
//!
//! ## ID Format
//!
//! All resource IDs use a prefixed format: `{prefix}-{hex}` where the hex
//! body is 8 or 17 lowercase hex digits.
//!
//! Examples:
//! - `i-0a1b2c3d4e5f60718`
//! - `vol-049df61146c4d7901`
//! - `ami-5fb8c835`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

#[doc(hidden)]
pub use macros::is_valid_body as __is_valid_body;

/// Re-export ulid for callers that need unique names alongside typed IDs.
pub use ulid::Ulid;
