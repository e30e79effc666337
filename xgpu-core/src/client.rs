//! gRPC clients over Unix sockets.
//!
//! Used to probe a freshly bound plugin socket and to register with the kubelet.

use crate::error::{PluginError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::debug;
use xgpu_api::deviceplugin::v1beta1::registration_client::RegistrationClient;
use xgpu_api::deviceplugin::v1beta1::RegisterRequest;

/// Open a channel to the gRPC server listening on `socket`.
pub async fn connect(socket: &Path, timeout: Duration) -> Result<Channel> {
    let socket: PathBuf = socket.to_path_buf();

    // Create a dummy URI (required by tonic but not used for Unix sockets)
    let endpoint = Endpoint::try_from("http://[::]:50051")
        .map_err(PluginError::internal)?
        .connect_timeout(timeout);

    let connecting = endpoint.connect_with_connector(service_fn({
        let socket = socket.clone();
        move |_: Uri| UnixStream::connect(socket.clone())
    }));

    match tokio::time::timeout(timeout, connecting).await {
        Ok(Ok(channel)) => Ok(channel),
        Ok(Err(e)) => Err(PluginError::Io {
            path: socket,
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, e.to_string()),
        }),
        Err(_) => Err(PluginError::Io {
            path: socket,
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
        }),
    }
}

/// Block until `socket` accepts a connection or `timeout` elapses.
pub async fn wait_for_server(socket: &Path, timeout: Duration) -> Result<()> {
    let channel = connect(socket, timeout).await?;
    drop(channel);
    debug!(socket = %socket.display(), "Plugin socket is accepting connections");
    Ok(())
}

/// Register a plugin with the kubelet listening on `kubelet_socket`.
pub async fn register(
    kubelet_socket: &Path,
    request: RegisterRequest,
    timeout: Duration,
) -> Result<()> {
    let resource = request.resource_name.clone();
    let channel = connect(kubelet_socket, timeout)
        .await
        .map_err(|e| PluginError::Registration { resource: resource.clone(), reason: e.to_string() })?;

    let mut client = RegistrationClient::new(channel);
    let call = client.register(tonic::Request::new(request));
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(status)) => Err(PluginError::Registration {
            resource,
            reason: status.message().to_string(),
        }),
        Err(_) => Err(PluginError::Registration {
            resource,
            reason: format!("kubelet did not answer within {:?}", timeout),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn test_register_times_out_on_silent_kubelet() {
        let tmp = tempfile::tempdir().unwrap();
        let socket = tmp.path().join("kubelet.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        // Accept and hold connections without ever speaking gRPC.
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let request = RegisterRequest {
            version: xgpu_api::VERSION.to_string(),
            endpoint: "kubevirt-a100.sock".to_string(),
            resource_name: "xdxct.com/a100".to_string(),
            options: None,
        };
        let started = Instant::now();
        let err = register(&socket, request, Duration::from_millis(300)).await.unwrap_err();

        assert!(matches!(err, PluginError::Registration { .. }));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_register_without_kubelet_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let err = register(
            &tmp.path().join("missing.sock"),
            RegisterRequest::default(),
            Duration::from_millis(300),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PluginError::Registration { .. }));
    }
}
