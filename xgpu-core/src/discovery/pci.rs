//! Physical device discovery.
//!
//! Scans the PCI device tree for functions of the target vendor that are bound
//! to the passthrough driver and groups them by IOMMU group.

use super::{sorted_entries, HardwareDevice, Scan, SkipReason};
use crate::config::TargetIdentity;
use crate::paths::HostPaths;
use crate::sysfs;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Physical devices grouped by IOMMU group, and groups by device class.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhysicalCatalog {
    /// Device-identity code (e.g. "a100") -> IOMMU groups holding such devices.
    pub classes: BTreeMap<String, Vec<String>>,
    /// IOMMU group -> member devices.
    pub groups: BTreeMap<String, Vec<HardwareDevice>>,
}

impl PhysicalCatalog {
    /// Members of `group`, if the group was discovered.
    pub fn devices_in(&self, group: &str) -> Option<&[HardwareDevice]> {
        self.groups.get(group).map(Vec::as_slice)
    }

    /// Whether `group` was discovered under `class`.
    pub fn class_contains(&self, class: &str, group: &str) -> bool {
        self.classes.get(class).is_some_and(|groups| groups.iter().any(|g| g == group))
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// A passthrough-ready function of the target vendor.
#[derive(Debug)]
struct Candidate {
    address: String,
    dir: PathBuf,
    group: String,
}

/// Build the physical catalog from the PCI device tree.
pub fn discover_physical(paths: &HostPaths, target: &TargetIdentity) -> PhysicalCatalog {
    let mut catalog = PhysicalCatalog::default();

    for candidate in scan(&paths.pci_devices, target).filter_map(Scan::found) {
        if !catalog.groups.contains_key(&candidate.group) {
            // The first member of a group decides the class the group is advertised under.
            let device_id = match sysfs::read_id(&candidate.dir, "device") {
                Ok(id) => id,
                Err(e) => {
                    warn!(address = %candidate.address, error = %e, "Skipping device without device id");
                    continue;
                }
            };
            catalog.classes.entry(device_id).or_default().push(candidate.group.clone());
        }

        debug!(address = %candidate.address, iommu_group = %candidate.group, "Discovered passthrough device");
        catalog
            .groups
            .entry(candidate.group)
            .or_default()
            .push(HardwareDevice::new(candidate.address));
    }

    info!(
        classes = catalog.classes.len(),
        groups = catalog.groups.len(),
        "Physical device discovery complete"
    );
    catalog
}

/// Lazily parse every entry of the PCI device tree.
fn scan<'a>(
    root: &Path,
    target: &'a TargetIdentity,
) -> impl Iterator<Item = Scan<Candidate>> + 'a {
    sorted_entries(root).into_iter().map(move |(address, dir)| inspect(address, dir, target))
}

fn inspect(address: String, dir: PathBuf, target: &TargetIdentity) -> Scan<Candidate> {
    let vendor = match sysfs::read_id(&dir, "vendor") {
        Ok(v) => v,
        Err(e) => return Scan::Skipped { entry: address, reason: SkipReason::Unreadable(e) },
    };
    if vendor != target.vendor_id {
        return Scan::Skipped { entry: address, reason: SkipReason::ForeignVendor(vendor) };
    }

    let driver = match sysfs::read_link_name(&dir, "driver") {
        Ok(d) => d,
        Err(e) => return Scan::Skipped { entry: address, reason: SkipReason::Unreadable(e) },
    };
    if driver != target.driver {
        return Scan::Skipped { entry: address, reason: SkipReason::OtherDriver(driver) };
    }

    match sysfs::read_link_name(&dir, "iommu_group") {
        Ok(group) => Scan::Found(Candidate { address, dir, group }),
        Err(e) => Scan::Skipped { entry: address, reason: SkipReason::Unreadable(e) },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn host(dir: &TempDir) -> HostPaths {
        let paths = HostPaths {
            pci_devices: dir.path().join("pci"),
            ..HostPaths::default()
        };
        fs::create_dir_all(&paths.pci_devices).unwrap();
        paths
    }

    fn add_device(paths: &HostPaths, addr: &str, vendor: &str, device: &str, driver: &str, group: &str) {
        let dir = paths.pci_devices.join(addr);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("vendor"), format!("0x{}\n", vendor)).unwrap();
        fs::write(dir.join("device"), format!("0x{}\n", device)).unwrap();
        symlink(format!("../../../bus/pci/drivers/{}", driver), dir.join("driver")).unwrap();
        symlink(format!("../../../kernel/iommu_groups/{}", group), dir.join("iommu_group")).unwrap();
    }

    #[test]
    fn test_single_device_catalog() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = host(&tmp);
        add_device(&paths, "0000:3d:00.0", "1eed", "a100", "vfio-pci", "42");

        let catalog = discover_physical(&paths, &TargetIdentity::default());
        assert_eq!(catalog.classes.get("a100"), Some(&vec!["42".to_string()]));
        assert_eq!(catalog.devices_in("42"), Some(&[HardwareDevice::new("0000:3d:00.0")][..]));
        assert!(catalog.class_contains("a100", "42"));
    }

    #[test]
    fn test_foreign_vendor_and_driver_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = host(&tmp);
        add_device(&paths, "0000:00:02.0", "8086", "a100", "vfio-pci", "1");
        add_device(&paths, "0000:3e:00.0", "1eed", "a100", "xdx", "43");

        let catalog = discover_physical(&paths, &TargetIdentity::default());
        assert!(catalog.is_empty());
        assert!(catalog.classes.is_empty());
    }

    #[test]
    fn test_group_members_share_one_class_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = host(&tmp);
        add_device(&paths, "0000:3d:00.0", "1eed", "a100", "vfio-pci", "42");
        add_device(&paths, "0000:3d:00.1", "1eed", "a101", "vfio-pci", "42");

        let catalog = discover_physical(&paths, &TargetIdentity::default());
        assert_eq!(catalog.classes.len(), 1);
        assert_eq!(catalog.classes["a100"], vec!["42".to_string()]);
        assert_eq!(catalog.groups["42"].len(), 2);
    }

    #[test]
    fn test_unreadable_entry_does_not_abort_walk() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = host(&tmp);
        fs::create_dir_all(paths.pci_devices.join("0000:00:00.0")).unwrap();
        add_device(&paths, "0000:3d:00.0", "1eed", "a100", "vfio-pci", "42");
        // Bound for passthrough but without an IOMMU group link.
        let broken = paths.pci_devices.join("0000:3f:00.0");
        fs::create_dir_all(&broken).unwrap();
        fs::write(broken.join("vendor"), "0x1eed\n").unwrap();
        symlink("../vfio-pci", broken.join("driver")).unwrap();

        let catalog = discover_physical(&paths, &TargetIdentity::default());
        assert_eq!(catalog.groups.len(), 1);
        assert!(catalog.groups.contains_key("42"));
    }

    #[test]
    fn test_discovery_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = host(&tmp);
        add_device(&paths, "0000:3d:00.0", "1eed", "a100", "vfio-pci", "42");
        add_device(&paths, "0000:5e:00.0", "1eed", "a100", "vfio-pci", "77");
        add_device(&paths, "0000:8a:00.0", "1eed", "b200", "vfio-pci", "90");

        let target = TargetIdentity::default();
        assert_eq!(discover_physical(&paths, &target), discover_physical(&paths, &target));
        assert_eq!(
            discover_physical(&paths, &target).classes["a100"],
            vec!["42".to_string(), "77".to_string()]
        );
    }

    #[test]
    fn test_missing_tree_yields_empty_catalog() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = HostPaths { pci_devices: tmp.path().join("absent"), ..HostPaths::default() };
        assert!(discover_physical(&paths, &TargetIdentity::default()).is_empty());
    }
}
