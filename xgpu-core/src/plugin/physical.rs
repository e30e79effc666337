//! Physical passthrough resources: one device class, advertised per IOMMU group.

use super::{address_env, vfio_specs, DeviceKind, Grant};
use crate::config::TargetIdentity;
use crate::discovery::PhysicalCatalog;
use crate::error::{PluginError, Result};
use crate::paths::{HostPaths, PCI_ENV_PREFIX};
use crate::validate;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use xgpu_api::deviceplugin::v1beta1::DeviceSpec;

/// IOMMU groups of vfio-bound devices.
///
/// The catalog is shared read-only by every class plugin.
#[derive(Debug, Clone)]
pub struct PhysicalKind {
    catalog: Arc<PhysicalCatalog>,
    paths: Arc<HostPaths>,
    target: TargetIdentity,
}

impl PhysicalKind {
    pub fn new(catalog: Arc<PhysicalCatalog>, paths: Arc<HostPaths>, target: TargetIdentity) -> Self {
        Self { catalog, paths, target }
    }
}

impl DeviceKind for PhysicalKind {
    fn label(&self) -> &'static str {
        "pci"
    }

    fn health_path(&self, group: &str) -> Option<PathBuf> {
        Some(self.paths.iommu_group(group))
    }

    fn resolve_and_validate(&self, class: &str, groups: &[String]) -> Result<Vec<Grant>> {
        let mut grants = Vec::with_capacity(groups.len());

        for group in groups {
            let devices = match self.catalog.devices_in(group) {
                Some(devices) if self.catalog.class_contains(class, group) => devices,
                _ => return Err(PluginError::UnknownDevice { device: group.clone() }),
            };

            for device in devices {
                validate::validate_physical(&self.paths.pci_devices, device, group, &self.target)?;
            }

            grants.push(Grant {
                id: group.clone(),
                devices: devices.to_vec(),
                node: self.paths.vfio_group(group),
            });
        }

        Ok(grants)
    }

    fn device_specs(&self, grants: &[Grant]) -> Vec<DeviceSpec> {
        vfio_specs(&self.paths, grants)
    }

    fn envs(&self, class: &str, grants: &[Grant]) -> HashMap<String, String> {
        address_env(PCI_ENV_PREFIX, class, grants)
    }
}
