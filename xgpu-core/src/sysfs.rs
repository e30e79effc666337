//! Read primitives over kernel device metadata.
//!
//! Discovery and allocation-time validation share these, so both sides compare
//! values normalized the same way.

use crate::error::{PluginError, Result};
use crate::paths::MDEV_TYPE_NAME_FILE;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Component, Path};

/// Extracts the type token from a mediated type description.
static MDEV_TYPE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Type Name: (\w+)").expect("Invalid mdev type regex"));

/// Read a value from a sysfs file.
pub fn read_value(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| PluginError::DiscoveryRead { path: path.to_path_buf(), source: e })
}

/// Read a hex identifier file (`vendor`, `device`) of a device entry.
///
/// `0x1eed\n` becomes `1eed`.
pub fn read_id(device_dir: &Path, property: &str) -> Result<String> {
    let value = read_value(&device_dir.join(property))?;
    Ok(value.trim_start_matches("0x").to_lowercase())
}

/// Resolve a link of a device entry (`driver`, `iommu_group`) to its final
/// path component.
pub fn read_link_name(device_dir: &Path, link: &str) -> Result<String> {
    let path = device_dir.join(link);
    let target = fs::read_link(&path)
        .map_err(|e| PluginError::DiscoveryRead { path: path.clone(), source: e })?;
    target.file_name().map(|n| n.to_string_lossy().to_string()).ok_or_else(|| {
        PluginError::InvalidMetadata {
            path,
            reason: format!("link target {} has no final component", target.display()),
        }
    })
}

/// Read the type token of a mediated device.
pub fn read_mdev_type(mdev_dir: &Path) -> Result<String> {
    let path = mdev_dir.join(MDEV_TYPE_NAME_FILE);
    let content = read_value(&path)?;
    parse_mdev_type(&content).ok_or_else(|| PluginError::InvalidMetadata {
        path,
        reason: "no `Type Name:` entry".to_string(),
    })
}

/// Extract the type token from the free-text type description.
pub fn parse_mdev_type(content: &str) -> Option<String> {
    MDEV_TYPE_REGEX.captures(content).and_then(|c| c.get(1)).map(|m| m.as_str().to_string())
}

/// Resolve the parent physical device of a mediated device entry.
///
/// The entry is a link into the parent's sysfs directory, so the parent address
/// is the second-to-last component of the link target.
pub fn read_mdev_parent(mdev_entry: &Path) -> Result<String> {
    let target = fs::read_link(mdev_entry)
        .map_err(|e| PluginError::DiscoveryRead { path: mdev_entry.to_path_buf(), source: e })?;
    let components: Vec<_> = target
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy().to_string()),
            _ => None,
        })
        .collect();
    match components.len() {
        n if n >= 2 => Ok(components[n - 2].trim().to_string()),
        _ => Err(PluginError::InvalidMetadata {
            path: mdev_entry.to_path_buf(),
            reason: format!("link target {} has no parent component", target.display()),
        }),
    }
}
