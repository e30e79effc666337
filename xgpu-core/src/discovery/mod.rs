//! Hardware discovery over kernel device metadata.
//!
//! Discovery walks two sysfs trees and builds the catalogs every plugin server
//! is created from:
//!
//! ```text
//! /sys/bus/pci/devices/<addr>          PhysicalCatalog
//! ├── vendor      (0x1eed)             ├── classes: device-id -> [iommu group]
//! ├── device      (0xa100)             └── groups:  iommu group -> [addr]
//! ├── driver      -> .../vfio-pci
//! └── iommu_group -> .../42
//!
//! /sys/bus/mdev/devices/<uuid>         MediatedCatalog
//! ├── mdev_type/name ("Type Name: X")  ├── types:   type -> [uuid]
//! └── (link into parent device dir)    └── parents: parent addr -> [uuid]
//! ```
//!
//! The walk is best-effort: every entry is parsed into a [`Scan`] result and a
//! skipped entry never aborts discovery. Catalogs are built once at startup and
//! shared read-only afterwards.

mod mdev;
mod pci;

pub use mdev::{discover_mediated, MediatedCatalog};
pub use pci::{discover_physical, PhysicalCatalog};

use crate::error::PluginError;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

/// One physical PCI function or one mediated device, identified by its
/// kernel-assigned address or UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HardwareDevice {
    pub address: String,
}

impl HardwareDevice {
    pub fn new(address: impl Into<String>) -> Self {
        Self { address: address.into() }
    }
}

impl fmt::Display for HardwareDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// Outcome of parsing one metadata entry.
#[derive(Debug)]
pub enum Scan<T> {
    Found(T),
    Skipped { entry: String, reason: SkipReason },
}

/// Why an entry did not make it into a catalog.
#[derive(Debug)]
pub enum SkipReason {
    /// Vendor differs from the target vendor.
    ForeignVendor(String),
    /// Bound to a driver other than the passthrough driver.
    OtherDriver(String),
    /// Some metadata could not be read or parsed.
    Unreadable(PluginError),
}

impl<T> Scan<T> {
    /// Log skips and keep successes.
    fn found(self) -> Option<T> {
        match self {
            Scan::Found(v) => Some(v),
            Scan::Skipped { entry, reason } => {
                match reason {
                    SkipReason::ForeignVendor(vendor) => {
                        trace!(entry = %entry, vendor = %vendor, "Skipping foreign device")
                    }
                    SkipReason::OtherDriver(driver) => {
                        debug!(entry = %entry, driver = %driver, "Skipping device not bound for passthrough")
                    }
                    SkipReason::Unreadable(err) => {
                        warn!(entry = %entry, error = %err, "Skipping unreadable device entry")
                    }
                }
                None
            }
        }
    }
}

/// List the entries of a metadata directory in name order.
///
/// An unreadable root yields no entries.
fn sorted_entries(root: &Path) -> Vec<(String, PathBuf)> {
    let read_dir = match fs::read_dir(root) {
        Ok(rd) => rd,
        Err(e) => {
            warn!(path = %root.display(), error = %e, "Device directory unavailable");
            return Vec::new();
        }
    };

    let mut entries: Vec<(String, PathBuf)> = read_dir
        .filter_map(|entry| match entry {
            Ok(entry) => Some((entry.file_name().to_string_lossy().to_string(), entry.path())),
            Err(e) => {
                warn!(path = %root.display(), error = %e, "Failed to read directory entry");
                None
            }
        })
        .collect();
    entries.sort();
    entries
}
