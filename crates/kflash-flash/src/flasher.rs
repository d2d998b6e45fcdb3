//! Dual-method flasher
//!
//! Firmware goes to the board through Katapult's `flashtool.py` or through
//! Klipper's own `make flash` target. The flasher tries an ordered list of
//! methods, first success wins, and each method gets its own full timeout.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use kflash_core::console::Console;
use kflash_core::models::{BootloaderStatus, FlashMethod, FlashResult};
use kflash_core::process::{CommandRunner, CommandSpec};
use kflash_core::usb::UsbBus;
use log::{info, warn};

use crate::error::{FlashError, Result};
use crate::probe::{BootloaderProbe, ProbeTiming};

/// Budget for one flash method
pub const FLASH_TIMEOUT: Duration = Duration::from_secs(60);

/// What to flash where
#[derive(Debug, Clone)]
pub struct FlashRequest<'r> {
    /// Live serial device path
    pub device_path: &'r Path,
    /// Firmware image
    pub firmware: &'r Path,
    /// Method tried first
    pub preferred: FlashMethod,
    /// Try the other method if the first fails
    pub allow_fallback: bool,
    /// Probe for the bootloader first; holds the runtime serial pattern
    pub probe_first: Option<&'r str>,
}

/// Methods to try, in order
pub fn attempt_plan(preferred: FlashMethod, allow_fallback: bool) -> Vec<FlashMethod> {
    let mut plan = vec![preferred];
    if allow_fallback {
        plan.push(preferred.other());
    }
    plan
}

/// Katapult-or-make flasher
pub struct DualFlasher<'a> {
    runner: &'a dyn CommandRunner,
    usb: &'a dyn UsbBus,
    console: &'a dyn Console,
    klipper_dir: PathBuf,
    katapult_dir: PathBuf,
    timeout: Duration,
    probe_timing: ProbeTiming,
}

impl<'a> DualFlasher<'a> {
    /// Flasher for the given Klipper and Katapult trees
    pub fn new(
        runner: &'a dyn CommandRunner,
        usb: &'a dyn UsbBus,
        console: &'a dyn Console,
        klipper_dir: impl Into<PathBuf>,
        katapult_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            usb,
            console,
            klipper_dir: klipper_dir.into(),
            katapult_dir: katapult_dir.into(),
            timeout: FLASH_TIMEOUT,
            probe_timing: ProbeTiming::default(),
        }
    }

    /// Per-method timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Timing for the optional bootloader pre-check
    pub fn probe_timing(mut self, timing: ProbeTiming) -> Self {
        self.probe_timing = timing;
        self
    }

    /// Flash `request.firmware` onto `request.device_path`
    ///
    /// A device path that no longer exists is [`FlashError::DeviceGone`];
    /// an inconclusive bootloader pre-check is [`FlashError::Probe`]. Every
    /// transfer failure is reported in the returned [`FlashResult`].
    pub fn flash(&self, request: &FlashRequest<'_>) -> Result<FlashResult> {
        let start = Instant::now();

        if !self.usb.exists(request.device_path) {
            return Err(FlashError::DeviceGone(request.device_path.to_path_buf()));
        }

        let mut plan = attempt_plan(request.preferred, request.allow_fallback);

        if let Some(pattern) = request.probe_first {
            let probe = BootloaderProbe::with_timing(self.runner, self.usb, self.probe_timing);
            let log = |m: &str| self.console.phase("Katapult", m);
            let check = probe.probe(
                request.device_path,
                pattern,
                &self.katapult_dir,
                Some(&log as &dyn Fn(&str)),
            );
            match check.status {
                BootloaderStatus::Present => {
                    if let Some(note) = &check.note {
                        self.console.warn(note);
                    }
                }
                BootloaderStatus::Absent => {
                    self.console
                        .phase("Katapult", "No bootloader found, skipping Katapult method");
                    plan.retain(|m| *m != FlashMethod::Katapult);
                }
                BootloaderStatus::Inconclusive { message } => {
                    return Err(FlashError::Probe(message));
                }
            }
            if plan.is_empty() {
                return Ok(FlashResult::failed(
                    FlashMethod::Katapult,
                    start.elapsed(),
                    "Katapult bootloader not present and fallback is disabled",
                ));
            }
            if !self.usb.exists(request.device_path) {
                return Err(FlashError::DeviceGone(request.device_path.to_path_buf()));
            }
        }

        let mut last: Option<FlashResult> = None;
        for (i, method) in plan.iter().copied().enumerate() {
            self.console
                .phase("Flash", &format!("Flashing via {}...", method));
            self.console.begin_activity(&format!("Flashing via {}", method));
            let result = match method {
                FlashMethod::Katapult => self.try_katapult(request.device_path, request.firmware),
                FlashMethod::MakeFlash => self.try_make_flash(request.device_path),
            };
            self.console.end_activity();

            if result.success {
                info!("Flashed {} via {}", request.device_path.display(), method);
                return Ok(FlashResult {
                    elapsed: start.elapsed(),
                    ..result
                });
            }

            let reason = result.error_message.clone().unwrap_or_default();
            warn!("{} failed: {}", method, reason);
            if i + 1 < plan.len() {
                self.console
                    .warn(&format!("{} failed: {}", method, reason));
                self.console.phase("Flash", "Trying fallback method...");
            }
            last = Some(result);
        }

        let last = last.unwrap_or_else(|| {
            FlashResult::failed(request.preferred, Duration::ZERO, "No flash methods attempted")
        });
        Ok(FlashResult {
            elapsed: start.elapsed(),
            ..last
        })
    }

    fn try_katapult(&self, device: &Path, firmware: &Path) -> FlashResult {
        let start = Instant::now();
        let flashtool = self.katapult_dir.join("scripts").join("flashtool.py");
        if !flashtool.exists() {
            return FlashResult::failed(
                FlashMethod::Katapult,
                start.elapsed(),
                format!("Katapult flashtool not found: {}", flashtool.display()),
            );
        }
        let spec = CommandSpec::new("python3")
            .arg(flashtool.to_string_lossy())
            .arg("-d")
            .arg(device.to_string_lossy())
            .arg("-f")
            .arg(firmware.to_string_lossy())
            .timeout(self.timeout);
        self.run_method(FlashMethod::Katapult, &spec, start)
    }

    fn try_make_flash(&self, device: &Path) -> FlashResult {
        let start = Instant::now();
        let spec = CommandSpec::new("make")
            .arg(format!("FLASH_DEVICE={}", device.display()))
            .arg("flash")
            .cwd(&self.klipper_dir)
            .timeout(self.timeout);
        self.run_method(FlashMethod::MakeFlash, &spec, start)
    }

    fn run_method(&self, method: FlashMethod, spec: &CommandSpec, start: Instant) -> FlashResult {
        match self.runner.run(spec) {
            Ok(output) if output.success() => FlashResult::ok(method, start.elapsed()),
            Ok(output) if output.timed_out => FlashResult::failed(
                method,
                start.elapsed(),
                format!(
                    "Flash timeout ({}s) - device may need manual recovery",
                    self.timeout.as_secs()
                ),
            ),
            Ok(output) => FlashResult::failed(method, start.elapsed(), output.failure_reason()),
            Err(e) => FlashResult::failed(method, start.elapsed(), e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kflash_dummy::{FakeUsbBus, RecordingConsole, Reply, ScriptedRunner};
    use std::fs;

    const DEVICE: &str = "usb-Klipper_rp2040_E66138935F253A2C-if00";

    struct Trees {
        _katapult: tempfile::TempDir,
        katapult: PathBuf,
        klipper: PathBuf,
    }

    fn trees() -> Trees {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("scripts")).unwrap();
        fs::write(dir.path().join("scripts/flashtool.py"), b"").unwrap();
        Trees {
            katapult: dir.path().to_path_buf(),
            _katapult: dir,
            klipper: PathBuf::from("/home/pi/klipper"),
        }
    }

    fn request<'r>(device: &'r Path, preferred: FlashMethod, fallback: bool) -> FlashRequest<'r> {
        FlashRequest {
            device_path: device,
            firmware: Path::new("/tmp/klipper.bin"),
            preferred,
            allow_fallback: fallback,
            probe_first: None,
        }
    }

    #[test]
    fn test_attempt_plan() {
        assert_eq!(
            attempt_plan(FlashMethod::Katapult, true),
            vec![FlashMethod::Katapult, FlashMethod::MakeFlash]
        );
        assert_eq!(
            attempt_plan(FlashMethod::MakeFlash, true),
            vec![FlashMethod::MakeFlash, FlashMethod::Katapult]
        );
        assert_eq!(attempt_plan(FlashMethod::Katapult, false), vec![FlashMethod::Katapult]);
    }

    #[test]
    fn test_primary_success() {
        let t = trees();
        let bus = FakeUsbBus::with_devices(&[DEVICE]);
        let runner = ScriptedRunner::new();
        runner.on("flashtool.py -d", Reply::ok());
        let console = RecordingConsole::new();
        let flasher = DualFlasher::new(&runner, &bus, &console, &t.klipper, &t.katapult);

        let device = bus.path(DEVICE);
        let result = flasher
            .flash(&request(&device, FlashMethod::Katapult, true))
            .unwrap();
        assert!(result.success);
        assert_eq!(result.method, FlashMethod::Katapult);
        assert!(!runner.called("make"));
    }

    #[test]
    fn test_fallback_success() {
        let t = trees();
        let bus = FakeUsbBus::with_devices(&[DEVICE]);
        let runner = ScriptedRunner::new();
        runner.on("flashtool.py -d", Reply::fail(1, "Timed out waiting for bootloader"));
        runner.on("flash", Reply::ok());
        let console = RecordingConsole::new();
        let flasher = DualFlasher::new(&runner, &bus, &console, &t.klipper, &t.katapult);

        let device = bus.path(DEVICE);
        let result = flasher
            .flash(&request(&device, FlashMethod::Katapult, true))
            .unwrap();
        assert!(result.success);
        assert_eq!(result.method, FlashMethod::MakeFlash);
        assert!(console.warnings()[0].contains("Timed out waiting for bootloader"));

        let make = runner
            .calls()
            .into_iter()
            .find(|c| c.line.starts_with("make"))
            .unwrap();
        assert_eq!(make.line, format!("make FLASH_DEVICE={} flash", device.display()));
        assert_eq!(make.cwd.as_deref(), Some(t.klipper.as_path()));
        // Each method gets the full budget
        assert!(runner.calls().iter().all(|c| c.timeout == FLASH_TIMEOUT));
    }

    #[test]
    fn test_both_fail_keeps_last_error() {
        let t = trees();
        let bus = FakeUsbBus::with_devices(&[DEVICE]);
        let runner = ScriptedRunner::new();
        runner.on("flashtool.py -d", Reply::timeout());
        runner.on("FLASH_DEVICE", Reply::fail(2, "make: *** [flash] Error 1"));
        let console = RecordingConsole::new();
        let flasher = DualFlasher::new(&runner, &bus, &console, &t.klipper, &t.katapult);

        let device = bus.path(DEVICE);
        let result = flasher
            .flash(&request(&device, FlashMethod::Katapult, true))
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.method, FlashMethod::MakeFlash);
        assert_eq!(result.error_message.as_deref(), Some("make: *** [flash] Error 1"));
    }

    #[test]
    fn test_no_fallback_when_disabled() {
        let t = trees();
        let bus = FakeUsbBus::with_devices(&[DEVICE]);
        let runner = ScriptedRunner::new();
        runner.on("flashtool.py -d", Reply::timeout());
        let console = RecordingConsole::new();
        let flasher = DualFlasher::new(&runner, &bus, &console, &t.klipper, &t.katapult);

        let device = bus.path(DEVICE);
        let result = flasher
            .flash(&request(&device, FlashMethod::Katapult, false))
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.method, FlashMethod::Katapult);
        assert!(result.error_message.unwrap().contains("manual recovery"));
        assert!(!runner.called("make"));
    }

    #[test]
    fn test_missing_device_is_distinct_error() {
        let t = trees();
        let bus = FakeUsbBus::new();
        let runner = ScriptedRunner::new();
        let console = RecordingConsole::new();
        let flasher = DualFlasher::new(&runner, &bus, &console, &t.klipper, &t.katapult);

        let device = bus.path(DEVICE);
        let err = flasher
            .flash(&request(&device, FlashMethod::Katapult, true))
            .unwrap_err();
        assert!(matches!(err, FlashError::DeviceGone(_)));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_probe_first_absent_skips_katapult() {
        let t = trees();
        let bus = FakeUsbBus::with_devices(&[DEVICE]);
        bus.on_reauthorize(&[], &[DEVICE]);
        let runner = ScriptedRunner::new();
        let b = bus.clone();
        runner.on_with("-r -d", Reply::ok(), move |_| b.remove(DEVICE));
        runner.on("FLASH_DEVICE", Reply::ok());
        let console = RecordingConsole::new();
        let fast = ProbeTiming {
            poll_interval: Duration::from_millis(1),
            poll_timeout: Duration::from_millis(10),
            settle_delay: Duration::ZERO,
            ..ProbeTiming::default()
        };
        let flasher =
            DualFlasher::new(&runner, &bus, &console, &t.klipper, &t.katapult).probe_timing(fast);

        let device = bus.path(DEVICE);
        let mut req = request(&device, FlashMethod::Katapult, true);
        req.probe_first = Some("usb-Klipper_rp2040_E661*");
        let result = flasher.flash(&req).unwrap();
        assert!(result.success);
        assert_eq!(result.method, FlashMethod::MakeFlash);
        assert!(!runner.called("flashtool.py -d"));
    }
}
