//! Shared fixtures: a fake host tree and a fake kubelet.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Server};
use tonic::{Request, Response, Status};
use xgpu_api::deviceplugin::v1beta1::device_plugin_client::DevicePluginClient;
use xgpu_api::deviceplugin::v1beta1::registration_server::{Registration, RegistrationServer};
use xgpu_api::deviceplugin::v1beta1::{Empty, RegisterRequest};
use xgpu_core::{client, HostPaths};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// A temporary directory laid out like the host's sysfs, /dev/vfio and the
/// kubelet device-plugin directory.
pub struct FakeHost {
    pub dir: TempDir,
    pub paths: HostPaths,
}

impl FakeHost {
    pub fn new() -> Self {
        let dir = tempfile::Builder::new().prefix("xgpu").tempdir().unwrap();
        let root = dir.path();
        let paths = HostPaths {
            pci_devices: root.join("sys/bus/pci/devices"),
            mdev_devices: root.join("sys/bus/mdev/devices"),
            iommu_groups: root.join("sys/kernel/iommu_groups"),
            vfio_dev: root.join("dev/vfio"),
            device_plugin_dir: root.join("plugins"),
            kubelet_socket: root.join("plugins/kubelet.sock"),
        };
        for dir in [
            &paths.pci_devices,
            &paths.mdev_devices,
            &paths.iommu_groups,
            &paths.vfio_dev,
            &paths.device_plugin_dir,
        ] {
            fs::create_dir_all(dir).unwrap();
        }
        Self { dir, paths }
    }

    /// Add a PCI function and its IOMMU group directory.
    pub fn add_pci(&self, addr: &str, vendor: &str, device: &str, driver: &str, group: &str) {
        let dir = self.paths.pci_devices.join(addr);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("vendor"), format!("0x{}\n", vendor)).unwrap();
        fs::write(dir.join("device"), format!("0x{}\n", device)).unwrap();
        symlink(format!("../../../bus/pci/drivers/{}", driver), dir.join("driver")).unwrap();
        symlink(self.paths.iommu_groups.join(group), dir.join("iommu_group")).unwrap();
        fs::create_dir_all(self.paths.iommu_groups.join(group)).unwrap();
    }

    /// Add a mediated device under `parent`, linked from the mdev bus.
    pub fn add_mdev(&self, uuid: &str, parent: &str, type_token: &str, group: Option<&str>) {
        let real = self.dir.path().join("sys/devices").join(parent).join(uuid);
        fs::create_dir_all(real.join("mdev_type")).unwrap();
        fs::write(real.join("mdev_type/name"), format!("Type Name: {}\n", type_token)).unwrap();
        if let Some(group) = group {
            symlink(self.paths.iommu_groups.join(group), real.join("iommu_group")).unwrap();
        }
        symlink(&real, self.paths.mdev_devices.join(uuid)).unwrap();
    }

    pub fn overwrite(&self, relative: &str, content: &str) {
        fs::write(self.dir.path().join(relative), content).unwrap();
    }

    pub fn group_dir(&self, group: &str) -> PathBuf {
        self.paths.iommu_groups.join(group)
    }
}

struct RecordingRegistration {
    tx: mpsc::UnboundedSender<RegisterRequest>,
}

#[tonic::async_trait]
impl Registration for RecordingRegistration {
    async fn register(&self, request: Request<RegisterRequest>) -> Result<Response<Empty>, Status> {
        let _ = self.tx.send(request.into_inner());
        Ok(Response::new(Empty {}))
    }
}

/// Kubelet registration endpoint that records every request.
pub struct FakeKubelet {
    requests: mpsc::UnboundedReceiver<RegisterRequest>,
    stop: CancellationToken,
}

impl FakeKubelet {
    pub async fn serve(socket: &Path) -> Self {
        let (tx, requests) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let listener = UnixListener::bind(socket).unwrap();

        let signal = stop.clone();
        tokio::spawn(async move {
            Server::builder()
                .add_service(RegistrationServer::new(RecordingRegistration { tx }))
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), signal.cancelled())
                .await
                .unwrap();
        });

        Self { requests, stop }
    }

    pub async fn next_request(&mut self) -> RegisterRequest {
        tokio::time::timeout(TIMEOUT, self.requests.recv())
            .await
            .expect("no registration within timeout")
            .expect("registration channel closed")
    }

    /// Whether another registration arrives within `window`.
    pub async fn registers_within(&mut self, window: Duration) -> bool {
        tokio::time::timeout(window, self.requests.recv()).await.is_ok()
    }
}

impl Drop for FakeKubelet {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

pub async fn dial(socket: &Path) -> DevicePluginClient<Channel> {
    DevicePluginClient::new(client::connect(socket, TIMEOUT).await.unwrap())
}

/// Poll `condition` until it holds or the timeout elapses.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}
