//! Centralized path and naming configuration.
//!
//! Every host path the plugin reads or writes goes through [`HostPaths`], so the
//! same engine runs against the real sysfs tree or a fake one in tests.

use std::path::{Path, PathBuf};

/// Sysfs directory of PCI functions, keyed by address.
pub const PCI_DEVICES_PATH: &str = "/sys/bus/pci/devices";

/// Sysfs directory of mediated devices, keyed by UUID.
pub const MDEV_DEVICES_PATH: &str = "/sys/bus/mdev/devices";

/// Sysfs directory of IOMMU groups.
pub const IOMMU_GROUPS_PATH: &str = "/sys/kernel/iommu_groups";

/// Path to VFIO device nodes.
pub const VFIO_DEV_PATH: &str = "/dev/vfio";

/// Name of the VFIO container node every passthrough container needs.
pub const VFIO_BRIDGE_NODE: &str = "vfio";

/// Namespace of every advertised resource.
pub const RESOURCE_NAMESPACE: &str = "xdxct.com";

/// Environment prefix for physical (whole-group) resources.
pub const PCI_ENV_PREFIX: &str = "PCI_RESOURCE_XDXCT_COM";

/// Environment prefix for mediated resources.
pub const MDEV_ENV_PREFIX: &str = "MDEV_PCI_RESOURCE_XDXCT_COM";

/// Cgroup permissions granted on device nodes.
pub const DEVICE_PERMISSIONS: &str = "mrw";

/// Attribute file holding a mediated device's type description.
pub const MDEV_TYPE_NAME_FILE: &str = "mdev_type/name";

/// Prefix of plugin socket file names.
const SOCKET_PREFIX: &str = "kubevirt";

/// Host filesystem layout used by discovery, validation and the plugin servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPaths {
    pub pci_devices: PathBuf,
    pub mdev_devices: PathBuf,
    pub iommu_groups: PathBuf,
    pub vfio_dev: PathBuf,
    pub device_plugin_dir: PathBuf,
    pub kubelet_socket: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            pci_devices: PathBuf::from(PCI_DEVICES_PATH),
            mdev_devices: PathBuf::from(MDEV_DEVICES_PATH),
            iommu_groups: PathBuf::from(IOMMU_GROUPS_PATH),
            vfio_dev: PathBuf::from(VFIO_DEV_PATH),
            device_plugin_dir: PathBuf::from(xgpu_api::DEVICE_PLUGIN_PATH),
            kubelet_socket: PathBuf::from(xgpu_api::KUBELET_SOCKET),
        }
    }
}

impl HostPaths {
    /// Socket path of the plugin serving `resource`.
    pub fn plugin_socket(&self, resource: &str) -> PathBuf {
        self.device_plugin_dir.join(format!("{}-{}.sock", SOCKET_PREFIX, resource))
    }

    /// The VFIO container node.
    pub fn vfio_bridge(&self) -> PathBuf {
        self.vfio_dev.join(VFIO_BRIDGE_NODE)
    }

    /// The VFIO node of one IOMMU group.
    pub fn vfio_group(&self, group: &str) -> PathBuf {
        self.vfio_dev.join(group)
    }

    /// Sysfs directory of one IOMMU group.
    pub fn iommu_group(&self, group: &str) -> PathBuf {
        self.iommu_groups.join(group)
    }
}

/// Fully qualified resource name registered with the kubelet.
pub fn resource_name(resource: &str) -> String {
    format!("{}/{}", RESOURCE_NAMESPACE, resource)
}

/// Environment variable carrying the granted devices of one resource.
pub fn env_key(prefix: &str, resource: &str) -> String {
    format!("{}_{}", prefix, resource)
}

/// Socket file name relative to the device-plugin directory.
pub fn socket_basename(socket: &Path) -> String {
    socket.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
}
