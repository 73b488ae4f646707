use crate::domain::models::ConnectionState;
use crate::infrastructure::bluetooth::platform::Permission;
use thiserror::Error;

/// Failures reported by the device link. None of them leave the link in an
/// ambiguous state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("missing runtime permission: {0:?}")]
    PermissionDenied(Permission),
    #[error("a scan is already in progress")]
    ScanInProgress,
    #[error("device {0} has not been discovered")]
    UnknownDevice(String),
    #[error("cannot connect while {0:?}")]
    AlreadyConnected(ConnectionState),
    #[error("invalid UUID: {0}")]
    InvalidUuid(String),
    #[error("bluetooth adapter unavailable")]
    AdapterUnavailable,
    #[error("no active connection")]
    NotConnected,
    #[error("platform error: {0}")]
    Platform(String),
}
