//! Resource plugin engine.
//!
//! One [`PluginServer`] serves one advertised resource: a device class of
//! physical IOMMU groups or a mediated device type. The lifecycle is shared;
//! what differs between the two is captured by [`DeviceKind`].
//!
//! ```text
//! ┌──────────────────────── PluginServer<K> ────────────────────────┐
//! │  start():  cleanup socket → bind → serve → probe → register     │
//! │            → spawn HealthMonitor                                │
//! │                                                                 │
//! │  DevicePluginService<K>          HealthMonitor                  │
//! │  ├── ListAndWatch  ◄── HealthEvent ── fs events (notify)        │
//! │  ├── Allocate → K::resolve_and_validate / device_specs / envs   │
//! │  └── options / preferred / pre-start (no-ops)                   │
//! │                                                                 │
//! │  socket removed → HealthMonitor → restart() = stop() + start()  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Two cancellation tokens drive shutdown: the process-wide `shutdown` token
//! shared by every instance, and a per-start `term` token that only ends this
//! instance's tasks, so a restart never disturbs its siblings.

mod health;
mod mediated;
mod physical;
mod server;
mod service;

pub use health::HealthMonitor;
pub use mediated::MediatedKind;
pub use physical::PhysicalKind;
pub use server::PluginServer;
pub use service::DevicePluginService;

use crate::discovery::HardwareDevice;
use crate::error::Result;
use crate::paths::{HostPaths, DEVICE_PERMISSIONS};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use xgpu_api::deviceplugin::v1beta1::{self as proto, DeviceSpec};

/// Health of an advertised device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Healthy => xgpu_api::HEALTHY,
            Health::Unhealthy => xgpu_api::UNHEALTHY,
        }
    }
}

/// The unit exposed to the kubelet: an IOMMU group or a mediated UUID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedDevice {
    pub id: String,
    pub health: Health,
}

impl AdvertisedDevice {
    pub fn healthy(id: impl Into<String>) -> Self {
        Self { id: id.into(), health: Health::Healthy }
    }
}

impl From<&AdvertisedDevice> for proto::Device {
    fn from(dev: &AdvertisedDevice) -> Self {
        proto::Device { id: dev.id.clone(), health: dev.health.as_str().to_string(), topology: None }
    }
}

/// A health transition reported by the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEvent {
    pub id: String,
    pub health: Health,
}

/// One requested device resolved to the hardware behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    /// Advertised id the kubelet asked for.
    pub id: String,
    /// Hardware the container receives.
    pub devices: Vec<HardwareDevice>,
    /// VFIO node giving access to that hardware.
    pub node: PathBuf,
}

/// What distinguishes physical from mediated resources.
pub trait DeviceKind: Send + Sync + 'static {
    /// Short label for logs ("pci", "mdev").
    fn label(&self) -> &'static str;

    /// Path whose presence tracks the health of `device_id`.
    ///
    /// `None` when the kind has no per-device signal; such devices stay Healthy.
    fn health_path(&self, device_id: &str) -> Option<PathBuf>;

    /// Resolve the requested ids of `resource` and re-check each against the host.
    ///
    /// Fails on the first unknown or drifted device.
    fn resolve_and_validate(&self, resource: &str, ids: &[String]) -> Result<Vec<Grant>>;

    /// Device nodes the container needs for `grants`.
    fn device_specs(&self, grants: &[Grant]) -> Vec<DeviceSpec>;

    /// Environment describing `grants` to the workload.
    fn envs(&self, resource: &str, grants: &[Grant]) -> HashMap<String, String>;
}

/// Lifecycle surface the orchestrator drives, independent of the device kind.
#[async_trait::async_trait]
pub trait ResourcePlugin: Send + Sync {
    /// Resource name without namespace.
    fn resource(&self) -> &str;

    async fn start(self: Arc<Self>) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

fn device_spec(path: &Path) -> DeviceSpec {
    let path = path.to_string_lossy().to_string();
    DeviceSpec { container_path: path.clone(), host_path: path, permissions: DEVICE_PERMISSIONS.to_string() }
}

/// The VFIO container node followed by each distinct grant node.
fn vfio_specs(paths: &HostPaths, grants: &[Grant]) -> Vec<DeviceSpec> {
    let mut nodes: Vec<&Path> = Vec::new();
    for grant in grants {
        if !nodes.contains(&grant.node.as_path()) {
            nodes.push(&grant.node);
        }
    }

    let bridge = paths.vfio_bridge();
    let mut specs = vec![device_spec(&bridge)];
    specs.extend(nodes.into_iter().filter(|n| *n != bridge.as_path()).map(device_spec));
    specs
}

/// `{prefix}_{resource}` = comma-joined hardware addresses of `grants`.
fn address_env(prefix: &str, resource: &str, grants: &[Grant]) -> HashMap<String, String> {
    let addresses: Vec<&str> =
        grants.iter().flat_map(|g| g.devices.iter().map(|d| d.address.as_str())).collect();

    let mut envs = HashMap::new();
    if !addresses.is_empty() {
        envs.insert(crate::paths::env_key(prefix, resource), addresses.join(","));
    }
    envs
}
