//! Error types for the device plugin.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for plugin operations.
pub type Result<T> = std::result::Result<T, PluginError>;

/// Main error type for the device plugin.
#[derive(Error, Debug)]
pub enum PluginError {
    // Discovery errors
    #[error("Failed to read {path:?}: {source}")]
    DiscoveryRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid device metadata at {path:?}: {reason}")]
    InvalidMetadata { path: PathBuf, reason: String },

    // Allocation errors
    #[error("unknown device: {device}")]
    UnknownDevice { device: String },

    #[error("device {device} changed on the host: {reason}")]
    StaleState { device: String, reason: String },

    #[error("device {device} has type {found}, expected {expected}")]
    TypeMismatch { device: String, expected: String, found: String },

    // Server lifecycle errors
    #[error("Failed to bind plugin socket {path:?}: {reason}")]
    Bind { path: PathBuf, reason: String },

    #[error("Failed to set up filesystem watch on {path:?}: {reason}")]
    WatcherSetup { path: PathBuf, reason: String },

    #[error("Failed to register {resource} with the kubelet: {reason}")]
    Registration { resource: String, reason: String },

    #[error("Plugin server for {resource} is already running")]
    AlreadyRunning { resource: String },

    #[error("Plugin server for {resource} is not running")]
    NotRunning { resource: String },

    #[error("Plugin server for {resource} cannot start during shutdown")]
    ShuttingDown { resource: String },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PluginError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Whether this error is an allocation-time validation failure.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::UnknownDevice { .. } | Self::StaleState { .. } | Self::TypeMismatch { .. }
        )
    }

    /// Short label used for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::DiscoveryRead { .. } => "discovery_read",
            Self::InvalidMetadata { .. } => "invalid_metadata",
            Self::UnknownDevice { .. } => "unknown_device",
            Self::StaleState { .. } => "stale_state",
            Self::TypeMismatch { .. } => "type_mismatch",
            Self::Bind { .. } => "bind",
            Self::WatcherSetup { .. } => "watcher_setup",
            Self::Registration { .. } => "registration",
            Self::AlreadyRunning { .. } => "already_running",
            Self::NotRunning { .. } => "not_running",
            Self::ShuttingDown { .. } => "shutting_down",
            Self::InvalidConfig { .. } => "invalid_config",
            Self::Io { .. } => "io",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<PluginError> for tonic::Status {
    fn from(err: PluginError) -> Self {
        if err.is_validation() {
            tonic::Status::invalid_argument(format!("invalid allocation request: {}", err))
        } else {
            tonic::Status::internal(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_maps_to_invalid_argument() {
        let status: tonic::Status = PluginError::StaleState {
            device: "0000:3d:00.0".to_string(),
            reason: "vendor is 8086".to_string(),
        }
        .into();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(status.message().starts_with("invalid allocation request:"));
        assert!(status.message().contains("0000:3d:00.0"));
    }

    #[test]
    fn test_other_errors_map_to_internal() {
        let status: tonic::Status = PluginError::Internal("boom".to_string()).into();
        assert_eq!(status.code(), tonic::Code::Internal);
    }
}
