//! Bootloader probe and recovery
//!
//! Asks a running board to jump into its Katapult bootloader and watches
//! the serial bus for the bootloader descriptor carrying the board's serial
//! number. A board without Katapult usually ends up detached and silent
//! after the request; it is brought back by toggling its USB `authorized`
//! flag, which re-enumerates it without a physical replug.
//!
//! The probe never returns an error. Every failure, including OS errors
//! from subprocesses and sysfs, becomes
//! [`BootloaderStatus::Inconclusive`] with a message.

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use kflash_core::discovery;
use kflash_core::models::{BootloaderCheckResult, BootloaderStatus};
use kflash_core::process::{CommandRunner, CommandSpec};
use kflash_core::usb::UsbBus;
use log::{debug, info, warn};

use crate::verify::poll_for_pattern;

/// Timeouts and delays used by the probe
///
/// The defaults come from measurements on real boards: the jump into the
/// bootloader completes in about 1.4s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTiming {
    /// Budget for `flashtool.py -r`
    pub entry_timeout: Duration,
    /// Serial bus poll interval
    pub poll_interval: Duration,
    /// Budget for a device to appear
    pub poll_timeout: Duration,
    /// Pause between deauthorizing and reauthorizing
    pub settle_delay: Duration,
}

impl Default for ProbeTiming {
    fn default() -> Self {
        Self {
            entry_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(250),
            poll_timeout: Duration::from_secs(5),
            settle_delay: Duration::from_millis(500),
        }
    }
}

/// Katapult presence probe
pub struct BootloaderProbe<'a> {
    runner: &'a dyn CommandRunner,
    usb: &'a dyn UsbBus,
    timing: ProbeTiming,
}

impl<'a> BootloaderProbe<'a> {
    /// Probe with default timing
    pub fn new(runner: &'a dyn CommandRunner, usb: &'a dyn UsbBus) -> Self {
        Self::with_timing(runner, usb, ProbeTiming::default())
    }

    /// Probe with custom timing
    pub fn with_timing(
        runner: &'a dyn CommandRunner,
        usb: &'a dyn UsbBus,
        timing: ProbeTiming,
    ) -> Self {
        Self {
            runner,
            usb,
            timing,
        }
    }

    /// Check whether the board at `device` has a Katapult bootloader
    ///
    /// `serial_pattern` is the registry pattern of the board in runtime
    /// mode; it is what recovery waits for. `log` receives progress lines.
    pub fn probe(
        &self,
        device: &Path,
        serial_pattern: &str,
        katapult_dir: &Path,
        log: Option<&dyn Fn(&str)>,
    ) -> BootloaderCheckResult {
        let start = Instant::now();
        let say = |msg: &str| {
            info!("{}", msg);
            if let Some(log) = log {
                log(msg);
            }
        };
        let conclude = |status: BootloaderStatus, note: Option<String>| BootloaderCheckResult {
            status,
            note,
            elapsed: start.elapsed(),
        };
        let inconclusive = |message: String| {
            warn!("Bootloader probe inconclusive: {}", message);
            conclude(BootloaderStatus::Inconclusive { message }, None)
        };

        let filename = device
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let Some(serial_hex) = discovery::extract_serial_hex(&filename) else {
            return inconclusive(format!(
                "Could not extract serial from device path {}",
                device.display()
            ));
        };

        // Resolve before the jump: once the runtime tty is gone it cannot be resolved.
        let authorized = match self.usb.authorization_path(device) {
            Ok(path) => path,
            Err(e) => return inconclusive(format!("Failed to resolve sysfs path: {}", e)),
        };

        let flashtool = katapult_dir.join("scripts").join("flashtool.py");
        if !flashtool.exists() {
            return inconclusive(format!(
                "Katapult flashtool not found: {}",
                flashtool.display()
            ));
        }

        say("Entering bootloader mode...");
        if let Err(message) = self.request_bootloader(&flashtool, device) {
            return inconclusive(message);
        }

        say("Polling for Katapult device...");
        let bootloader_pattern = discovery::bootloader_pattern(&serial_hex);
        if let Some(found) = self.poll(&bootloader_pattern) {
            say("Katapult detected, returning device to runtime mode...");
            // Best effort: the verdict stands whether or not the board comes back.
            if let Err(e) = self.request_bootloader(&flashtool, &found.path) {
                debug!("Return-to-runtime request failed: {}", e);
            }
            let note = match self.poll(serial_pattern) {
                Some(_) => None,
                None => Some("Device may still be in bootloader mode".to_string()),
            };
            return conclude(BootloaderStatus::Present, note);
        }

        say("No Katapult detected, recovering device...");
        if let Err(e) = self.reauthorize(&authorized) {
            return inconclusive(format!(
                "USB reset failed: {}. Unplug and replug the board to recover it",
                e
            ));
        }

        match self.poll(serial_pattern) {
            Some(_) => conclude(BootloaderStatus::Absent, None),
            None => inconclusive(
                "Device did not recover after USB reset; manual intervention may be needed \
                 (unplug and replug the board)"
                    .to_string(),
            ),
        }
    }

    fn request_bootloader(&self, flashtool: &Path, device: &Path) -> Result<(), String> {
        let spec = CommandSpec::new("python3")
            .arg(flashtool.to_string_lossy())
            .args(["-r", "-d"])
            .arg(device.to_string_lossy())
            .timeout(self.timing.entry_timeout);
        let output = self
            .runner
            .run(&spec)
            .map_err(|e| format!("Failed to run flashtool.py: {}", e))?;
        if output.timed_out {
            return Err(format!(
                "flashtool.py -r timed out ({}s)",
                self.timing.entry_timeout.as_secs_f64()
            ));
        }
        if !output.success() {
            return Err(output.failure_reason());
        }
        Ok(())
    }

    fn reauthorize(&self, authorized: &Path) -> Result<(), kflash_core::usb::UsbError> {
        self.usb.set_authorized(authorized, false)?;
        thread::sleep(self.timing.settle_delay);
        self.usb.set_authorized(authorized, true)
    }

    fn poll(&self, pattern: &str) -> Option<discovery::SerialDevice> {
        poll_for_pattern(
            self.usb,
            pattern,
            self.timing.poll_interval,
            self.timing.poll_timeout,
        )
    }
}
