//! sysfs-backed USB bus

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kflash_core::discovery::SERIAL_BY_ID;
use kflash_core::process::{CommandRunner, CommandSpec};
use kflash_core::usb::{UsbBus, UsbError};
use log::debug;

use crate::error::{LinuxUsbError, Result};

/// Sysfs root for tty devices
const TTY_SYSFS_ROOT: &str = "/sys/class/tty";

/// Timeout for one `sudo tee` write
const TEE_TIMEOUT: Duration = Duration::from_secs(10);

/// Linux USB bus
///
/// Serial devices are listed from `serial_dir` and mapped to sysfs through
/// `tty_root`. Both default to the real system locations; tests point them
/// at a temporary tree.
pub struct SysfsUsbBus<'a> {
    runner: &'a dyn CommandRunner,
    serial_dir: PathBuf,
    tty_root: PathBuf,
}

impl<'a> SysfsUsbBus<'a> {
    /// Bus using the system locations; writes go through `runner`
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self::with_roots(runner, SERIAL_BY_ID, TTY_SYSFS_ROOT)
    }

    /// Bus using custom serial and sysfs roots
    pub fn with_roots(
        runner: &'a dyn CommandRunner,
        serial_dir: impl Into<PathBuf>,
        tty_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            serial_dir: serial_dir.into(),
            tty_root: tty_root.into(),
        }
    }

    /// Resolve a serial symlink to its USB `authorized` attribute
    pub fn resolve_authorized(&self, device: &Path) -> Result<PathBuf> {
        let real = fs::canonicalize(device).map_err(|source| LinuxUsbError::Resolve {
            path: device.to_path_buf(),
            source,
        })?;
        let tty = real
            .file_name()
            .ok_or_else(|| LinuxUsbError::NotTty(real.clone()))?;

        let link = self.tty_root.join(tty).join("device");
        if !link.exists() {
            return Err(LinuxUsbError::SysfsMissing(link));
        }
        let iface = fs::canonicalize(&link).map_err(|source| LinuxUsbError::Resolve {
            path: link.clone(),
            source,
        })?;
        let usb_dev = iface
            .parent()
            .ok_or_else(|| LinuxUsbError::SysfsMissing(iface.clone()))?;

        let authorized = usb_dev.join("authorized");
        if !authorized.exists() {
            return Err(LinuxUsbError::AuthorizedMissing(authorized));
        }
        debug!("{} -> {}", device.display(), authorized.display());
        Ok(authorized)
    }

    /// Write `0` or `1` to an `authorized` attribute through `sudo tee`
    pub fn write_authorized(&self, path: &Path, on: bool) -> Result<()> {
        let value = if on { "1" } else { "0" };
        let spec = CommandSpec::new("sudo")
            .arg("tee")
            .arg(path.to_string_lossy())
            .stdin(value)
            .tty()
            .timeout(TEE_TIMEOUT);
        let output = self.runner.run(&spec)?;
        if !output.success() {
            return Err(LinuxUsbError::WriteFailed {
                path: path.to_path_buf(),
                value,
                reason: output.failure_reason(),
            });
        }
        Ok(())
    }
}

impl UsbBus for SysfsUsbBus<'_> {
    fn serial_dir(&self) -> &Path {
        &self.serial_dir
    }

    fn authorization_path(&self, device: &Path) -> std::result::Result<PathBuf, UsbError> {
        Ok(self.resolve_authorized(device)?)
    }

    fn set_authorized(&self, authorized_path: &Path, on: bool) -> std::result::Result<(), UsbError> {
        Ok(self.write_authorized(authorized_path, on)?)
    }
}
