//! Device-plugin gRPC API
//!
//! This crate carries the kubelet device-plugin contract (`v1beta1`) that every
//! resource plugin serves and the `Registration` service it calls on the kubelet.
//! The protobuf definitions are in `proto/deviceplugin.proto` and code-generated
//! via `tonic-build`.

pub mod deviceplugin {
    pub mod v1beta1 {
        tonic::include_proto!("v1beta1");
    }
}

/// Device-plugin API version sent on registration.
pub const VERSION: &str = "v1beta1";

/// Directory where the kubelet expects plugin sockets.
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins/";

/// Kubelet registration socket.
pub const KUBELET_SOCKET: &str = "/var/lib/kubelet/device-plugins/kubelet.sock";

/// Health value for a device that may be scheduled.
pub const HEALTHY: &str = "Healthy";

/// Health value for a device the kubelet must not schedule.
pub const UNHEALTHY: &str = "Unhealthy";
