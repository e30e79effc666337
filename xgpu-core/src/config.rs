//! Configuration management.

use crate::error::{PluginError, Result};
use crate::paths::HostPaths;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file.
const DEFAULT_CONFIG_PATH: &str = "/etc/xgpu-device-plugin/config.json";

/// PCI vendor ids are four lowercase or uppercase hex digits.
static VENDOR_ID_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-fA-F]{4}$").expect("Invalid vendor id regex"));

/// Persistent configuration for the device plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub vendor_id: String,
    pub passthrough_driver: String,
    pub pci_devices_path: PathBuf,
    pub mdev_devices_path: PathBuf,
    pub iommu_groups_path: PathBuf,
    pub vfio_dev_path: PathBuf,
    pub device_plugin_dir: PathBuf,
    pub kubelet_socket: PathBuf,
    pub connect_timeout_secs: u64,
    pub metrics_port: Option<u16>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let host = HostPaths::default();
        Self {
            vendor_id: "1eed".to_string(),
            passthrough_driver: "vfio-pci".to_string(),
            pci_devices_path: host.pci_devices,
            mdev_devices_path: host.mdev_devices,
            iommu_groups_path: host.iommu_groups,
            vfio_dev_path: host.vfio_dev,
            device_plugin_dir: host.device_plugin_dir,
            kubelet_socket: host.kubelet_socket,
            connect_timeout_secs: 5,
            metrics_port: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Get the path to the configuration file.
    ///
    /// `XGPU_CONFIG` overrides the default location.
    pub fn config_path() -> PathBuf {
        std::env::var("XGPU_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load configuration from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults when it is absent.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| PluginError::InvalidConfig {
            reason: format!("Failed to read config {}: {}", path.display(), e),
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            PluginError::InvalidConfig { reason: format!("Failed to parse config: {}", e) }
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the plugin cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !VENDOR_ID_REGEX.is_match(&self.vendor_id) {
            return Err(PluginError::InvalidConfig {
                reason: format!(
                    "vendor_id must be four hex digits (e.g. 1eed), got {:?}",
                    self.vendor_id
                ),
            });
        }
        if self.passthrough_driver.trim().is_empty() {
            return Err(PluginError::InvalidConfig {
                reason: "passthrough_driver must not be empty".to_string(),
            });
        }
        if self.connect_timeout_secs == 0 {
            return Err(PluginError::InvalidConfig {
                reason: "connect_timeout_secs must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Vendor id in the normalized form discovery compares against.
    pub fn normalized_vendor_id(&self) -> String {
        self.vendor_id.trim().trim_start_matches("0x").to_lowercase()
    }

    /// Timeout for dialing plugin and kubelet sockets.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Host layout described by this configuration.
    pub fn host_paths(&self) -> HostPaths {
        HostPaths {
            pci_devices: self.pci_devices_path.clone(),
            mdev_devices: self.mdev_devices_path.clone(),
            iommu_groups: self.iommu_groups_path.clone(),
            vfio_dev: self.vfio_dev_path.clone(),
            device_plugin_dir: self.device_plugin_dir.clone(),
            kubelet_socket: self.kubelet_socket.clone(),
        }
    }
}

/// Identity every discovered physical device must match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetIdentity {
    pub vendor_id: String,
    pub driver: String,
}

impl From<&Config> for TargetIdentity {
    fn from(config: &Config) -> Self {
        Self {
            vendor_id: config.normalized_vendor_id(),
            driver: config.passthrough_driver.clone(),
        }
    }
}

impl Default for TargetIdentity {
    fn default() -> Self {
        (&Config::default()).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.host_paths(), HostPaths::default());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.vendor_id, "1eed");
    }

    #[test]
    fn test_partial_file_overrides_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"vendor_id": "10DE", "connect_timeout_secs": 2}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.normalized_vendor_id(), "10de");
        assert_eq!(config.connect_timeout(), Duration::from_secs(2));
        assert_eq!(config.passthrough_driver, "vfio-pci");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = Config { vendor_id: "nvidia".to_string(), ..Config::default() };
        assert!(matches!(config.validate(), Err(PluginError::InvalidConfig { .. })));

        let config = Config { connect_timeout_secs: 0, ..Config::default() };
        assert!(config.validate().is_err());

        let config = Config { passthrough_driver: " ".to_string(), ..Config::default() };
        assert!(config.validate().is_err());
    }
}
