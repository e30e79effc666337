//! xGPU Core Library
//!
//! Host discovery, allocation-time validation and the kubelet resource-plugin
//! engine for passthrough accelerators.

pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod observability;
pub mod paths;
pub mod plugin;
pub mod sysfs;
pub mod validate;

// Re-export commonly used items
pub use config::{Config, TargetIdentity};
pub use discovery::{
    discover_mediated, discover_physical, HardwareDevice, MediatedCatalog, PhysicalCatalog,
};
pub use error::{PluginError, Result};
pub use observability::{init as init_observability, shutdown as shutdown_observability};
pub use paths::HostPaths;
pub use plugin::{
    AdvertisedDevice, DeviceKind, Health, HealthEvent, MediatedKind, PhysicalKind, PluginServer,
    ResourcePlugin,
};
