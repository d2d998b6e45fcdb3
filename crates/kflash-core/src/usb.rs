//! USB bus seam
//!
//! The probe, flasher and orchestrator only touch USB through [`UsbBus`]:
//! listing serial devices, checking and canonicalizing their paths, and
//! toggling the kernel `authorized` flag that forces a re-enumeration.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::discovery::{self, SerialDevice};

/// USB topology or authorization failure
#[derive(Debug, Error)]
pub enum UsbError {
    /// The device path does not exist
    #[error("device '{}' is not present", .0.display())]
    Missing(PathBuf),

    /// Backend-specific failure
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

/// Access to the host's USB serial devices
pub trait UsbBus {
    /// Directory holding stable serial symlinks
    fn serial_dir(&self) -> &Path;

    /// Enumerate serial devices, sorted by name
    fn scan(&self) -> Vec<SerialDevice> {
        discovery::scan(self.serial_dir())
    }

    /// Whether a device path currently exists
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    /// Resolve every symlink in a device path
    fn canonical_path(&self, path: &Path) -> io::Result<PathBuf> {
        fs::canonicalize(path)
    }

    /// Locate the `authorized` attribute of the USB device behind `device`
    fn authorization_path(&self, device: &Path) -> Result<PathBuf, UsbError>;

    /// Write the `authorized` attribute
    fn set_authorized(&self, authorized_path: &Path, on: bool) -> Result<(), UsbError>;
}
