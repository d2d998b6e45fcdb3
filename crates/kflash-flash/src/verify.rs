//! Polling the serial bus for devices to appear

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use kflash_core::discovery::{self, SerialDevice};
use kflash_core::usb::UsbBus;
use log::trace;

/// Scan `usb` every `interval` until `pick` finds something or `timeout`
/// passes. The bus is always scanned at least once.
pub(crate) fn poll<T>(
    usb: &dyn UsbBus,
    interval: Duration,
    timeout: Duration,
    mut pick: impl FnMut(&[SerialDevice]) -> Option<T>,
) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        let devices = usb.scan();
        trace!("poll: {} serial device(s)", devices.len());
        if let Some(found) = pick(&devices) {
            return Some(found);
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(interval);
    }
}

/// First device whose name matches `pattern` exactly, without prefix variants
pub(crate) fn poll_for_pattern(
    usb: &dyn UsbBus,
    pattern: &str,
    interval: Duration,
    timeout: Duration,
) -> Option<SerialDevice> {
    poll(usb, interval, timeout, |devices| {
        devices
            .iter()
            .find(|d| discovery::glob_matches(pattern, &d.filename))
            .cloned()
    })
}

/// Wait for a flashed device to come back in runtime mode
///
/// Returns the runtime path, or a reason: the board reappeared in the
/// bootloader, under an unexpected name, or not at all.
pub fn wait_for_runtime(
    usb: &dyn UsbBus,
    serial_pattern: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<PathBuf, String> {
    let found = poll(usb, interval, timeout, |devices| {
        discovery::match_device(serial_pattern, devices).cloned()
    });
    match found {
        Some(device) if discovery::is_runtime(&device.filename) => Ok(device.path),
        Some(device) if discovery::is_bootloader(&device.filename) => {
            Err(format!("Device in bootloader mode (katapult): {}", device.filename))
        }
        Some(device) => Err(format!("Unexpected device prefix: {}", device.filename)),
        None => Err(format!(
            "Timeout after {}s waiting for device",
            timeout.as_secs()
        )),
    }
}
