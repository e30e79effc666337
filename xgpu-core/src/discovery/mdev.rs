//! Mediated device discovery.

use super::{sorted_entries, HardwareDevice, Scan, SkipReason};
use crate::paths::HostPaths;
use crate::sysfs;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Mediated devices grouped by type, plus the parent reverse index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediatedCatalog {
    /// Type token (e.g. "XGV_V0") -> instantiated UUIDs.
    pub types: BTreeMap<String, Vec<HardwareDevice>>,
    /// Parent PCI address -> mediated UUIDs. Informational only.
    pub parents: BTreeMap<String, Vec<String>>,
}

impl MediatedCatalog {
    /// Whether `uuid` was discovered with type `mdev_type`.
    pub fn type_contains(&self, mdev_type: &str, uuid: &str) -> bool {
        self.types.get(mdev_type).is_some_and(|devs| devs.iter().any(|d| d.address == uuid))
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[derive(Debug)]
struct Candidate {
    uuid: String,
    mdev_type: String,
    parent: Option<String>,
}

/// Build the mediated catalog from the mdev device tree.
pub fn discover_mediated(paths: &HostPaths) -> MediatedCatalog {
    let mut catalog = MediatedCatalog::default();

    for candidate in scan(&paths.mdev_devices).filter_map(Scan::found) {
        debug!(
            uuid = %candidate.uuid,
            mdev_type = %candidate.mdev_type,
            parent = ?candidate.parent,
            "Discovered mediated device"
        );
        if let Some(parent) = candidate.parent {
            catalog.parents.entry(parent).or_default().push(candidate.uuid.clone());
        }
        catalog
            .types
            .entry(candidate.mdev_type)
            .or_default()
            .push(HardwareDevice::new(candidate.uuid));
    }

    info!(
        types = catalog.types.len(),
        parents = catalog.parents.len(),
        "Mediated device discovery complete"
    );
    catalog
}

fn scan(root: &Path) -> impl Iterator<Item = Scan<Candidate>> {
    sorted_entries(root).into_iter().map(|(uuid, entry)| inspect(uuid, entry))
}

fn inspect(uuid: String, entry: PathBuf) -> Scan<Candidate> {
    let mdev_type = match sysfs::read_mdev_type(&entry) {
        Ok(t) => t,
        Err(e) => return Scan::Skipped { entry: uuid, reason: SkipReason::Unreadable(e) },
    };
    // The parent index is informational; the device is still advertised.
    let parent = match sysfs::read_mdev_parent(&entry) {
        Ok(parent) => Some(parent),
        Err(e) => {
            warn!(uuid = %uuid, error = %e, "Mediated device parent unreadable");
            None
        }
    };
    Scan::Found(Candidate { uuid, mdev_type, parent })
}
