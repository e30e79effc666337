//! Plugin orchestration.
//!
//! Discovers the host once, creates one plugin server per physical device
//! class and one per mediated type, starts them all and stops them again on
//! shutdown. A resource that fails to start is logged and left out; the
//! others keep serving.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use xgpu_core::{
    discover_mediated, discover_physical, AdvertisedDevice, Config, HostPaths, MediatedCatalog,
    MediatedKind, PhysicalCatalog, PhysicalKind, PluginServer, ResourcePlugin, TargetIdentity,
};

pub struct PluginOrchestrator {
    paths: Arc<HostPaths>,
    target: TargetIdentity,
    connect_timeout: Duration,
    shutdown: CancellationToken,
}

impl PluginOrchestrator {
    pub fn new(config: &Config, shutdown: CancellationToken) -> Self {
        Self {
            paths: Arc::new(config.host_paths()),
            target: TargetIdentity::from(config),
            connect_timeout: config.connect_timeout(),
            shutdown,
        }
    }

    /// Discover devices and create a (stopped) plugin per advertised resource.
    pub fn discover(&self) -> Vec<Arc<dyn ResourcePlugin>> {
        let physical = Arc::new(discover_physical(&self.paths, &self.target));
        let mediated = Arc::new(discover_mediated(&self.paths));
        log_summary(&physical, &mediated);

        let mut plugins: Vec<Arc<dyn ResourcePlugin>> = Vec::new();

        let kind = Arc::new(PhysicalKind::new(physical.clone(), self.paths.clone(), self.target.clone()));
        for (class, groups) in &physical.classes {
            let devices = groups.iter().map(AdvertisedDevice::healthy).collect();
            plugins.push(PluginServer::new(
                kind.clone(),
                class.as_str(),
                devices,
                &self.paths,
                self.connect_timeout,
                self.shutdown.clone(),
            ));
        }

        let kind = Arc::new(MediatedKind::new(mediated.clone(), self.paths.clone()));
        for (mdev_type, uuids) in &mediated.types {
            let devices = uuids.iter().map(|d| AdvertisedDevice::healthy(&d.address)).collect();
            plugins.push(PluginServer::new(
                kind.clone(),
                mdev_type.as_str(),
                devices,
                &self.paths,
                self.connect_timeout,
                self.shutdown.clone(),
            ));
        }

        plugins
    }

    /// Start every plugin concurrently, returning the ones that came up.
    ///
    /// Each start is bounded by the connect timeout, so one unresponsive
    /// kubelet cannot hold back the others or the shutdown path.
    pub async fn start_all(&self, plugins: Vec<Arc<dyn ResourcePlugin>>) -> Vec<Arc<dyn ResourcePlugin>> {
        let mut starts = JoinSet::new();
        for (order, plugin) in plugins.into_iter().enumerate() {
            starts.spawn(async move {
                let result = Arc::clone(&plugin).start().await;
                (order, plugin, result)
            });
        }

        let mut started = Vec::with_capacity(starts.len());
        while let Some(joined) = starts.join_next().await {
            match joined {
                Ok((order, plugin, Ok(()))) => started.push((order, plugin)),
                Ok((_, plugin, Err(e))) => {
                    error!(resource = plugin.resource(), error = %e, "Failed to start plugin")
                }
                Err(e) => error!(error = %e, "Plugin start task panicked"),
            }
        }
        // Keep discovery order.
        started.sort_by_key(|(order, _)| *order);
        started.into_iter().map(|(_, plugin)| plugin).collect()
    }

    /// Stop every plugin; failures are logged and do not stop the others.
    pub async fn stop_all(&self, plugins: &[Arc<dyn ResourcePlugin>]) {
        for plugin in plugins {
            if let Err(e) = plugin.stop().await {
                warn!(resource = plugin.resource(), error = %e, "Failed to stop plugin");
            }
        }
    }

    /// Serve until shutdown is requested.
    pub async fn run(&self) {
        let plugins = self.discover();
        if plugins.is_empty() {
            warn!("No passthrough or mediated devices found, nothing to advertise");
        }

        let running = self.start_all(plugins).await;
        info!(plugins = running.len(), "xgpu device plugin ready");

        self.shutdown.cancelled().await;
        info!("Stopping plugins...");
        self.stop_all(&running).await;
    }
}

fn log_summary(physical: &PhysicalCatalog, mediated: &MediatedCatalog) {
    for (class, groups) in &physical.classes {
        info!(class = %class, groups = ?groups, "Physical device class");
    }
    for (group, devices) in &physical.groups {
        let addresses: Vec<&str> = devices.iter().map(|d| d.address.as_str()).collect();
        info!(iommu_group = %group, devices = ?addresses, "IOMMU group");
    }
    for (mdev_type, uuids) in &mediated.types {
        info!(mdev_type = %mdev_type, count = uuids.len(), "Mediated device type");
    }
    for (parent, uuids) in &mediated.parents {
        info!(parent = %parent, mediated = ?uuids, "Mediated devices by parent");
    }
}
