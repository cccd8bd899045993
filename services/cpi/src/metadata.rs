//! Metadata to tag conversion.

use serde_json::{Map, Value};

use crate::cloud::Tags;

/// Orchestrator metadata: arbitrary JSON values keyed by name.
pub type Metadata = Map<String, Value>;

pub const MAX_TAG_KEY_LEN: usize = 127;
pub const MAX_TAG_VALUE_LEN: usize = 255;

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Render a metadata value as a tag value.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn lookup(metadata: &Metadata, key: &str) -> Option<String> {
    metadata
        .get(key)
        .filter(|v| !v.is_null())
        .map(stringify)
        .filter(|s| !s.is_empty())
}

/// Insert a tag, enforcing the provider's key and value limits.
pub fn insert_tag(tags: &mut Tags, key: &str, value: &str) {
    tags.insert(
        truncate(key, MAX_TAG_KEY_LEN),
        truncate(value, MAX_TAG_VALUE_LEN),
    );
}

/// Convert every metadata entry into a tag.
pub fn to_tags(metadata: &Metadata) -> Tags {
    let mut tags = Tags::new();
    for (key, value) in metadata {
        insert_tag(&mut tags, key, &stringify(value));
    }
    tags
}

/// The `Name` tag for a VM: explicit `name`, else `job/index`, else
/// `compiling/<package>`.
pub fn name_tag(metadata: &Metadata) -> Option<String> {
    if let Some(name) = lookup(metadata, "name") {
        return Some(name);
    }
    if let (Some(job), Some(index)) = (lookup(metadata, "job"), lookup(metadata, "index")) {
        return Some(format!("{job}/{index}"));
    }
    lookup(metadata, "compiling").map(|package| format!("compiling/{package}"))
}

/// Tags applied to a VM and all of its volumes.
pub fn vm_tags(metadata: &Metadata) -> Tags {
    let mut tags = to_tags(metadata);
    if let Some(name) = name_tag(metadata) {
        insert_tag(&mut tags, "Name", &name);
    }
    tags
}

/// Snapshot description: `deployment/job/index` plus the device's last
/// path component when known.
pub fn snapshot_description(metadata: &Metadata, device: Option<&str>) -> String {
    let mut parts: Vec<String> = ["deployment", "job", "index"]
        .iter()
        .filter_map(|key| lookup(metadata, key))
        .collect();
    if let Some(suffix) = device.and_then(|d| d.rsplit('/').next()) {
        if !suffix.is_empty() {
            parts.push(suffix.to_string());
        }
    }
    parts.join("/")
}
