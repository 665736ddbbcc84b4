//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("USB error: {0}")]
    Usb(String),

    #[error("Permission denied for device {0}")]
    PermissionDenied(String),

    #[error("Timed out waiting for permission result for device {0}")]
    PermissionTimeout(String),

    #[error("Permission request for device {0} was cancelled")]
    PermissionCancelled(String),

    #[error("Another thread is already waiting on the permission request for device {0}")]
    PermissionInFlight(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
