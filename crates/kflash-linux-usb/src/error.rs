//! Error types for Linux USB operations

use std::io;
use std::path::PathBuf;

use kflash_core::process::ProcessError;
use kflash_core::usb::UsbError;
use thiserror::Error;

/// Linux USB-specific errors
#[derive(Debug, Error)]
pub enum LinuxUsbError {
    /// Device node could not be resolved
    #[error("Cannot resolve '{}': {source}", path.display())]
    Resolve {
        /// Path being resolved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Resolved node has no file name
    #[error("'{}' does not name a tty device", .0.display())]
    NotTty(PathBuf),

    /// tty has no sysfs device link
    #[error("sysfs path not found: {}", .0.display())]
    SysfsMissing(PathBuf),

    /// USB device directory has no authorized attribute
    #[error("USB authorized file not found: {}", .0.display())]
    AuthorizedMissing(PathBuf),

    /// `sudo tee` could not be run
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// `sudo tee` ran and failed
    #[error("Failed to write '{value}' to {}: {reason}", path.display())]
    WriteFailed {
        /// Attribute path
        path: PathBuf,
        /// Value written
        value: &'static str,
        /// stderr or exit status
        reason: String,
    },
}

impl From<LinuxUsbError> for UsbError {
    fn from(e: LinuxUsbError) -> Self {
        UsbError::Backend(Box::new(e))
    }
}

/// Result type for Linux USB operations
pub type Result<T> = std::result::Result<T, LinuxUsbError>;
