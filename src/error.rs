use thiserror::Error;

use crate::topology::DevicePath;
use crate::transport::TransportError;

/// Lifecycle errors of the port mapper and its attached devices.
#[derive(Debug, Error)]
pub enum Error {
    /// Root hubs are topology anchors, never attachable devices.
    #[error("device {0} is a root hub")]
    RootHub(DevicePath),

    #[error("unsupported bcdUSB {bcd:#06x} for device {path}")]
    UnsupportedUsbVersion { path: DevicePath, bcd: u16 },

    #[error("failed to spawn dispatcher thread")]
    Thread(#[source] std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
