//! Lifecycle of one resource plugin: socket, gRPC server, registration and
//! health monitor.

use super::health::HealthMonitor;
use super::service::{DevicePluginService, DeviceState};
use super::{AdvertisedDevice, DeviceKind, HealthEvent, ResourcePlugin};
use crate::client;
use crate::error::{PluginError, Result};
use crate::observability::metrics;
use crate::paths::{self, HostPaths};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{debug, error, info, warn};
use xgpu_api::deviceplugin::v1beta1::device_plugin_server::DevicePluginServer;
use xgpu_api::deviceplugin::v1beta1::{DevicePluginOptions, RegisterRequest};

/// Capacity of the monitor -> ListAndWatch health channel.
const HEALTH_CHANNEL_CAPACITY: usize = 64;

/// How long a stopping gRPC server may drain before it is aborted.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Tasks of one start, ended together by `term`.
struct Running {
    term: CancellationToken,
    serve: JoinHandle<()>,
}

/// Serves one resource on its own socket in the device-plugin directory.
pub struct PluginServer<K: DeviceKind> {
    kind: Arc<K>,
    resource: String,
    socket: PathBuf,
    kubelet_socket: PathBuf,
    connect_timeout: Duration,
    device_ids: Vec<String>,
    state: Arc<Mutex<DeviceState>>,
    health_tx: mpsc::Sender<HealthEvent>,
    shutdown: CancellationToken,
    running: Mutex<Option<Running>>,
}

impl<K: DeviceKind> PluginServer<K> {
    /// Create a stopped server advertising `devices` under `resource`.
    pub fn new(
        kind: Arc<K>,
        resource: impl Into<String>,
        devices: Vec<AdvertisedDevice>,
        paths: &HostPaths,
        connect_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let resource = resource.into();
        let (health_tx, health_rx) = mpsc::channel(HEALTH_CHANNEL_CAPACITY);
        let device_ids = devices.iter().map(|d| d.id.clone()).collect();
        metrics::set_advertised_devices(&resource, devices.len());

        Arc::new(Self {
            kind,
            socket: paths.plugin_socket(&resource),
            kubelet_socket: paths.kubelet_socket.clone(),
            resource,
            connect_timeout,
            device_ids,
            state: Arc::new(Mutex::new(DeviceState::new(devices, health_rx))),
            health_tx,
            shutdown,
            running: Mutex::new(None),
        })
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Bind the socket, serve, register with the kubelet and start the
    /// health monitor.
    ///
    /// Registration failures are logged; the server keeps serving so the
    /// kubelet can still reach it after it comes back.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(PluginError::AlreadyRunning { resource: self.resource.clone() });
        }
        if self.shutdown.is_cancelled() {
            return Err(PluginError::ShuttingDown { resource: self.resource.clone() });
        }

        self.remove_socket()?;
        let listener = UnixListener::bind(&self.socket)
            .map_err(|e| PluginError::Bind { path: self.socket.clone(), reason: e.to_string() })?;

        let term = CancellationToken::new();
        let service = DevicePluginService::new(
            self.kind.clone(),
            self.resource.clone(),
            self.state.clone(),
            self.shutdown.clone(),
            term.clone(),
        );

        let serve = tokio::spawn({
            let resource = self.resource.clone();
            let signal = term.clone();
            async move {
                let result = Server::builder()
                    .add_service(DevicePluginServer::new(service))
                    .serve_with_incoming_shutdown(UnixListenerStream::new(listener), signal.cancelled())
                    .await;
                if let Err(e) = result {
                    error!(resource = %resource, error = %e, "Plugin gRPC server failed");
                }
            }
        });

        if let Err(e) = client::wait_for_server(&self.socket, self.connect_timeout).await {
            warn!(resource = %self.resource, error = %e, "Plugin socket did not answer the readiness probe");
        }

        // Watches are established before registering so a failure leaves
        // nothing registered behind a dead socket.
        let monitor = match HealthMonitor::watch(
            self.kind.as_ref(),
            &self.resource,
            &self.socket,
            &self.device_ids,
            self.health_tx.clone(),
            term.clone(),
            self.shutdown.clone(),
        ) {
            Ok(monitor) => monitor,
            Err(e) => {
                error!(resource = %self.resource, error = %e, "Health monitor setup failed");
                term.cancel();
                serve.abort();
                let _ = self.remove_socket();
                return Err(e);
            }
        };

        self.register().await;

        tokio::spawn(monitor.run(Arc::clone(self)));
        *running = Some(Running { term, serve });

        info!(
            resource = %self.resource,
            kind = self.kind.label(),
            socket = %self.socket.display(),
            devices = self.device_ids.len(),
            "Plugin server started"
        );
        Ok(())
    }

    /// End this instance's tasks and remove its socket. Stopping a stopped
    /// server is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let Some(Running { term, mut serve }) = running.take() else {
            debug!(resource = %self.resource, "Plugin server already stopped");
            return Ok(());
        };

        term.cancel();
        if tokio::time::timeout(STOP_GRACE, &mut serve).await.is_err() {
            warn!(resource = %self.resource, "gRPC server did not drain in time, aborting");
            serve.abort();
        }

        self.remove_socket()?;
        info!(resource = %self.resource, "Plugin server stopped");
        Ok(())
    }

    /// Stop and start again with a fresh termination token.
    ///
    /// Boxed because it is driven from the health monitor that `start` spawns.
    pub fn restart(self: Arc<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        Box::pin(async move {
            if !self.is_running().await {
                return Err(PluginError::NotRunning { resource: self.resource.clone() });
            }

            info!(resource = %self.resource, "Restarting plugin server");
            metrics::record_restart(&self.resource);

            if let Err(e) = PluginServer::stop(&self).await {
                warn!(resource = %self.resource, error = %e, "Stop during restart failed");
            }
            PluginServer::start(&self).await
        })
    }

    async fn register(&self) {
        let request = RegisterRequest {
            version: xgpu_api::VERSION.to_string(),
            endpoint: paths::socket_basename(&self.socket),
            resource_name: paths::resource_name(&self.resource),
            options: Some(DevicePluginOptions {
                pre_start_required: false,
                get_preferred_allocation_available: false,
            }),
        };

        match client::register(&self.kubelet_socket, request, self.connect_timeout).await {
            Ok(()) => {
                info!(resource = %paths::resource_name(&self.resource), "Registered with the kubelet");
                metrics::record_registration(&self.resource, true);
            }
            Err(e) => {
                warn!(resource = %self.resource, error = %e, "Kubelet registration failed");
                metrics::record_registration(&self.resource, false);
            }
        }
    }

    fn remove_socket(&self) -> Result<()> {
        match std::fs::remove_file(&self.socket) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PluginError::Io { path: self.socket.clone(), source: e }),
        }
    }
}

#[async_trait::async_trait]
impl<K: DeviceKind> ResourcePlugin for PluginServer<K> {
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn start(self: Arc<Self>) -> Result<()> {
        PluginServer::start(&self).await
    }

    async fn stop(&self) -> Result<()> {
        PluginServer::stop(self).await
    }
}
