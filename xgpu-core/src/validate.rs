//! Allocation-time validation against live kernel metadata.
//!
//! The catalogs describe the host as it was at discovery time. Before a device
//! is handed to a container its identity is read again:
//!
//! 1. **Physical**: the device must still sit in the same IOMMU group, still
//!    report the target vendor and still be bound to the passthrough driver.
//! 2. **Mediated**: the device must still exist with the same type token.
//!
//! Any mismatch rejects the whole request; nothing is granted partially.

use crate::config::TargetIdentity;
use crate::discovery::HardwareDevice;
use crate::error::{PluginError, Result};
use crate::sysfs;
use std::path::Path;
use tracing::warn;

/// Re-check a physical device against the group it was catalogued under.
pub fn validate_physical(
    pci_root: &Path,
    device: &HardwareDevice,
    expected_group: &str,
    target: &TargetIdentity,
) -> Result<()> {
    let dir = pci_root.join(&device.address);

    let group = sysfs::read_link_name(&dir, "iommu_group").map_err(|e| stale(device, e))?;
    if group != expected_group {
        warn!(address = %device, expected = %expected_group, found = %group, "IOMMU group changed on the host");
        return Err(PluginError::StaleState {
            device: device.address.clone(),
            reason: format!("IOMMU group is {}, expected {}", group, expected_group),
        });
    }

    let vendor = sysfs::read_id(&dir, "vendor").map_err(|e| stale(device, e))?;
    if vendor != target.vendor_id {
        warn!(address = %device, expected = %target.vendor_id, found = %vendor, "Vendor changed on the host");
        return Err(PluginError::StaleState {
            device: device.address.clone(),
            reason: format!("vendor is {}, expected {}", vendor, target.vendor_id),
        });
    }

    let driver = sysfs::read_link_name(&dir, "driver").map_err(|e| stale(device, e))?;
    if driver != target.driver {
        warn!(address = %device, expected = %target.driver, found = %driver, "Driver changed on the host");
        return Err(PluginError::StaleState {
            device: device.address.clone(),
            reason: format!("bound to {}, expected {}", driver, target.driver),
        });
    }

    Ok(())
}

/// Re-check a mediated device's type token.
pub fn validate_mediated(mdev_root: &Path, uuid: &str, expected_type: &str) -> Result<()> {
    let found = sysfs::read_mdev_type(&mdev_root.join(uuid)).map_err(|e| {
        PluginError::StaleState { device: uuid.to_string(), reason: e.to_string() }
    })?;
    if found != expected_type {
        warn!(uuid = %uuid, expected = %expected_type, found = %found, "Mediated type changed on the host");
        return Err(PluginError::TypeMismatch {
            device: uuid.to_string(),
            expected: expected_type.to_string(),
            found,
        });
    }
    Ok(())
}

fn stale(device: &HardwareDevice, err: PluginError) -> PluginError {
    PluginError::StaleState { device: device.address.clone(), reason: err.to_string() }
}
