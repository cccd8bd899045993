//! Encryption policy resolution.
//!
//! Three layers can say whether a volume or image is encrypted and with
//! which key: the global configuration, the resource class, and the
//! request itself. The highest layer that sets `encrypted` decides the
//! flag; the key is taken from that layer or a higher one.

use serde::{Deserialize, Serialize};

/// One layer of encryption settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionLayer {
    pub encrypted: Option<bool>,
    pub key_ref: Option<String>,
}

impl EncryptionLayer {
    pub fn new(encrypted: Option<bool>, key_ref: Option<String>) -> Self {
        Self { encrypted, key_ref }
    }
}

/// Resolved encryption settings for one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionPolicy {
    pub encrypted: bool,
    /// Key reference; `None` means the provider default key.
    pub key_ref: Option<String>,
}

/// Resolve encryption with precedence explicit > class > global.
pub fn resolve(
    global: &EncryptionLayer,
    class: &EncryptionLayer,
    explicit: &EncryptionLayer,
) -> EncryptionPolicy {
    // Highest precedence first.
    let layers = [explicit, class, global];

    let Some(deciding) = layers.iter().position(|l| l.encrypted.is_some()) else {
        return EncryptionPolicy::default();
    };

    if layers[deciding].encrypted != Some(true) {
        return EncryptionPolicy::default();
    }

    let key_ref = layers[..=deciding]
        .iter()
        .find_map(|l| l.key_ref.clone());

    EncryptionPolicy {
        encrypted: true,
        key_ref,
    }
}
