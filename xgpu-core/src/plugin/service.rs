//! Kubelet-facing gRPC service of one plugin instance.

use super::{AdvertisedDevice, DeviceKind, HealthEvent};
use crate::observability::metrics;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};
use xgpu_api::deviceplugin::v1beta1::device_plugin_server::DevicePlugin;
use xgpu_api::deviceplugin::v1beta1::{
    AllocateRequest, AllocateResponse, ContainerAllocateResponse, DevicePluginOptions, Empty,
    ListAndWatchResponse, PreStartContainerRequest, PreStartContainerResponse,
    PreferredAllocationRequest, PreferredAllocationResponse,
};

/// Advertised devices of one resource and the health events that update them.
///
/// Outlives individual server starts so that a restarted instance keeps the
/// last known health.
#[derive(Debug)]
pub(crate) struct DeviceState {
    devices: Vec<AdvertisedDevice>,
    health_rx: mpsc::Receiver<HealthEvent>,
}

impl DeviceState {
    pub(crate) fn new(devices: Vec<AdvertisedDevice>, health_rx: mpsc::Receiver<HealthEvent>) -> Self {
        Self { devices, health_rx }
    }

    /// Apply `event`; true when a device actually changed health.
    pub(crate) fn apply(&mut self, event: &HealthEvent) -> bool {
        match self.devices.iter_mut().find(|d| d.id == event.id) {
            Some(dev) if dev.health != event.health => {
                dev.health = event.health;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn snapshot(&self) -> ListAndWatchResponse {
        ListAndWatchResponse { devices: self.devices.iter().map(Into::into).collect() }
    }
}

/// gRPC handler bound to one start of a plugin server.
pub struct DevicePluginService<K: DeviceKind> {
    kind: Arc<K>,
    resource: String,
    state: Arc<Mutex<DeviceState>>,
    shutdown: CancellationToken,
    term: CancellationToken,
}

impl<K: DeviceKind> DevicePluginService<K> {
    pub(crate) fn new(
        kind: Arc<K>,
        resource: String,
        state: Arc<Mutex<DeviceState>>,
        shutdown: CancellationToken,
        term: CancellationToken,
    ) -> Self {
        Self { kind, resource, state, shutdown, term }
    }
}

#[tonic::async_trait]
impl<K: DeviceKind> DevicePlugin for DevicePluginService<K> {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<DevicePluginOptions>, Status> {
        Ok(Response::new(DevicePluginOptions {
            pre_start_required: false,
            get_preferred_allocation_available: false,
        }))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = std::result::Result<ListAndWatchResponse, Status>> + Send>>;

    #[instrument(skip_all, fields(resource = %self.resource))]
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<Self::ListAndWatchStream>, Status> {
        info!("gRPC: ListAndWatch");

        let (tx, rx) = mpsc::channel(16);
        let state = self.state.clone();
        let resource = self.resource.clone();
        let shutdown = self.shutdown.clone();
        let term = self.term.clone();

        tokio::spawn(async move {
            let mut state = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                _ = term.cancelled() => return,
                guard = state.lock_owned() => guard,
            };

            if tx.send(Ok(state.snapshot())).await.is_err() {
                return;
            }

            loop {
                let event = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = term.cancelled() => break,
                    _ = tx.closed() => {
                        debug!(resource = %resource, "ListAndWatch client went away");
                        break;
                    }
                    event = state.health_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                if !state.apply(&event) {
                    continue;
                }
                info!(resource = %resource, device = %event.id, health = event.health.as_str(), "Device health changed");
                metrics::record_health_transition(&resource, event.health.as_str());

                if tx.send(Ok(state.snapshot())).await.is_err() {
                    break;
                }
            }
        });

        let stream = tokio_stream::wrappers::ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream) as Self::ListAndWatchStream))
    }

    async fn get_preferred_allocation(
        &self,
        _request: Request<PreferredAllocationRequest>,
    ) -> std::result::Result<Response<PreferredAllocationResponse>, Status> {
        Ok(Response::new(PreferredAllocationResponse::default()))
    }

    #[instrument(skip_all, fields(resource = %self.resource))]
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> std::result::Result<Response<AllocateResponse>, Status> {
        let req = request.into_inner();
        info!(containers = req.container_requests.len(), "gRPC: Allocate");

        let mut container_responses = Vec::with_capacity(req.container_requests.len());
        for container in &req.container_requests {
            let ids = distinct_ids(&container.devices_ids);
            let grants = match self.kind.resolve_and_validate(&self.resource, &ids) {
                Ok(grants) => grants,
                Err(e) => {
                    warn!(devices = ?container.devices_ids, error = %e, "Allocation rejected");
                    metrics::record_allocation_failure(&self.resource, e.reason());
                    return Err(e.into());
                }
            };

            debug!(kind = self.kind.label(), devices = ?container.devices_ids, "Allocation validated");
            container_responses.push(ContainerAllocateResponse {
                envs: self.kind.envs(&self.resource, &grants),
                devices: self.kind.device_specs(&grants),
                ..Default::default()
            });
        }

        metrics::record_allocation(&self.resource);
        Ok(Response::new(AllocateResponse { container_responses }))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> std::result::Result<Response<PreStartContainerResponse>, Status> {
        Ok(Response::new(PreStartContainerResponse::default()))
    }
}

/// Requested ids in request order, each once.
fn distinct_ids(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter().filter(|id| seen.insert(*id)).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::HardwareDevice;
    use crate::error::{PluginError, Result};
    use crate::plugin::{Grant, Health};
    use std::collections::HashMap;
    use std::path::PathBuf;
    use tokio_stream::StreamExt;
    use xgpu_api::deviceplugin::v1beta1::{ContainerAllocateRequest, DeviceSpec};

    /// Accepts ids starting with "ok", rejects everything else.
    struct StubKind;

    impl DeviceKind for StubKind {
        fn label(&self) -> &'static str {
            "stub"
        }

        fn health_path(&self, _id: &str) -> Option<PathBuf> {
            None
        }

        fn resolve_and_validate(&self, _resource: &str, ids: &[String]) -> Result<Vec<Grant>> {
            ids.iter()
                .map(|id| {
                    if id.starts_with("ok") {
                        Ok(Grant {
                            id: id.clone(),
                            devices: vec![HardwareDevice::new(format!("hw-{}", id))],
                            node: PathBuf::from(format!("/dev/vfio/{}", id)),
                        })
                    } else {
                        Err(PluginError::UnknownDevice { device: id.clone() })
                    }
                })
                .collect()
        }

        fn device_specs(&self, grants: &[Grant]) -> Vec<DeviceSpec> {
            grants
                .iter()
                .map(|g| DeviceSpec {
                    host_path: g.node.to_string_lossy().to_string(),
                    ..Default::default()
                })
                .collect()
        }

        fn envs(&self, resource: &str, grants: &[Grant]) -> HashMap<String, String> {
            HashMap::from([(resource.to_string(), grants.len().to_string())])
        }
    }

    fn service(devices: &[&str]) -> (DevicePluginService<StubKind>, mpsc::Sender<HealthEvent>) {
        let (health_tx, health_rx) = mpsc::channel(8);
        let state = DeviceState::new(devices.iter().map(|d| AdvertisedDevice::healthy(*d)).collect(), health_rx);
        let service = DevicePluginService::new(
            Arc::new(StubKind),
            "stub".to_string(),
            Arc::new(Mutex::new(state)),
            CancellationToken::new(),
            CancellationToken::new(),
        );
        (service, health_tx)
    }

    fn allocate_request(containers: &[&[&str]]) -> Request<AllocateRequest> {
        Request::new(AllocateRequest {
            container_requests: containers
                .iter()
                .map(|ids| ContainerAllocateRequest { devices_ids: ids.iter().map(|s| s.to_string()).collect() })
                .collect(),
        })
    }

    #[test]
    fn test_apply_reports_only_changes() {
        let (_tx, rx) = mpsc::channel(1);
        let mut state = DeviceState::new(vec![AdvertisedDevice::healthy("42")], rx);

        assert!(!state.apply(&HealthEvent { id: "42".into(), health: Health::Healthy }));
        assert!(state.apply(&HealthEvent { id: "42".into(), health: Health::Unhealthy }));
        assert!(!state.apply(&HealthEvent { id: "42".into(), health: Health::Unhealthy }));
        assert!(!state.apply(&HealthEvent { id: "99".into(), health: Health::Unhealthy }));
        assert_eq!(state.snapshot().devices[0].health, "Unhealthy");
    }

    #[tokio::test]
    async fn test_allocate_one_response_per_container() {
        let (service, _tx) = service(&["ok-1", "ok-2"]);
        let resp = service.allocate(allocate_request(&[&["ok-1"], &["ok-2", "ok-3"]])).await.unwrap();

        let resp = resp.into_inner();
        assert_eq!(resp.container_responses.len(), 2);
        assert_eq!(resp.container_responses[1].devices.len(), 2);
        assert_eq!(resp.container_responses[1].envs["stub"], "2");
    }

    #[tokio::test]
    async fn test_allocate_repeated_id_granted_once() {
        let (service, _tx) = service(&["ok-1", "ok-2"]);
        let resp = service.allocate(allocate_request(&[&["ok-2", "ok-1", "ok-2"]])).await.unwrap();

        let container = &resp.into_inner().container_responses[0];
        let hosts: Vec<&str> = container.devices.iter().map(|d| d.host_path.as_str()).collect();
        assert_eq!(hosts, vec!["/dev/vfio/ok-2", "/dev/vfio/ok-1"]);
        assert_eq!(container.envs["stub"], "2");
    }

    #[tokio::test]
    async fn test_allocate_rejects_whole_request() {
        let (service, _tx) = service(&["ok-1"]);
        let status = service.allocate(allocate_request(&[&["ok-1"], &["bad"]])).await.unwrap_err();

        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(status.message().contains("bad"));
    }

    #[tokio::test]
    async fn test_options_and_no_op_rpcs() {
        let (service, _tx) = service(&[]);
        let opts = service.get_device_plugin_options(Request::new(Empty {})).await.unwrap().into_inner();
        assert!(!opts.pre_start_required);
        assert!(!opts.get_preferred_allocation_available);

        let pre = service
            .pre_start_container(Request::new(PreStartContainerRequest::default()))
            .await
            .unwrap();
        assert_eq!(pre.into_inner(), PreStartContainerResponse::default());
    }

    #[tokio::test]
    async fn test_list_and_watch_resends_on_change() {
        let (service, tx) = service(&["ok-1", "ok-2"]);
        let mut stream = service.list_and_watch(Request::new(Empty {})).await.unwrap().into_inner();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.devices.len(), 2);
        assert!(first.devices.iter().all(|d| d.health == "Healthy"));

        // No-op event is swallowed, the transition is sent.
        tx.send(HealthEvent { id: "ok-1".into(), health: Health::Healthy }).await.unwrap();
        tx.send(HealthEvent { id: "ok-2".into(), health: Health::Unhealthy }).await.unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.devices[0].health, "Healthy");
        assert_eq!(second.devices[1].health, "Unhealthy");
    }

    #[tokio::test]
    async fn test_list_and_watch_ends_on_term() {
        let (service, _tx) = service(&["ok-1"]);
        let term = service.term.clone();
        let mut stream = service.list_and_watch(Request::new(Empty {})).await.unwrap().into_inner();

        assert!(stream.next().await.is_some());
        term.cancel();
        assert!(stream.next().await.is_none());
    }
}
