//! Mediated vGPU resources: one type, advertised per instantiated UUID.

use super::{address_env, vfio_specs, DeviceKind, Grant};
use crate::discovery::{HardwareDevice, MediatedCatalog};
use crate::error::{PluginError, Result};
use crate::paths::{HostPaths, MDEV_ENV_PREFIX};
use crate::{sysfs, validate};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use xgpu_api::deviceplugin::v1beta1::DeviceSpec;

#[derive(Debug, Clone)]
pub struct MediatedKind {
    catalog: Arc<MediatedCatalog>,
    paths: Arc<HostPaths>,
}

impl MediatedKind {
    pub fn new(catalog: Arc<MediatedCatalog>, paths: Arc<HostPaths>) -> Self {
        Self { catalog, paths }
    }

    /// VFIO node of the group the mediated device was placed in.
    ///
    /// Falls back to the whole VFIO directory when the group link is missing.
    fn vfio_node(&self, uuid: &str) -> PathBuf {
        match sysfs::read_link_name(&self.paths.mdev_devices.join(uuid), "iommu_group") {
            Ok(group) => self.paths.vfio_group(&group),
            Err(e) => {
                debug!(uuid = %uuid, error = %e, "No IOMMU group link, granting the VFIO directory");
                self.paths.vfio_dev.clone()
            }
        }
    }
}

impl DeviceKind for MediatedKind {
    fn label(&self) -> &'static str {
        "mdev"
    }

    // Mediated devices carry no per-device health signal.
    fn health_path(&self, _uuid: &str) -> Option<PathBuf> {
        None
    }

    fn resolve_and_validate(&self, mdev_type: &str, uuids: &[String]) -> Result<Vec<Grant>> {
        let mut grants = Vec::with_capacity(uuids.len());

        for uuid in uuids {
            if !self.catalog.type_contains(mdev_type, uuid) {
                return Err(PluginError::UnknownDevice { device: uuid.clone() });
            }
            validate::validate_mediated(&self.paths.mdev_devices, uuid, mdev_type)?;

            grants.push(Grant {
                id: uuid.clone(),
                devices: vec![HardwareDevice::new(uuid.clone())],
                node: self.vfio_node(uuid),
            });
        }

        Ok(grants)
    }

    fn device_specs(&self, grants: &[Grant]) -> Vec<DeviceSpec> {
        vfio_specs(&self.paths, grants)
    }

    fn envs(&self, mdev_type: &str, grants: &[Grant]) -> HashMap<String, String> {
        address_env(MDEV_ENV_PREFIX, mdev_type, grants)
    }
}
