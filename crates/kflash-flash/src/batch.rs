//! Batch orchestrator: flash every eligible registered device
//!
//! The run is a fixed sequence of stages. Preflight and the print-status
//! gate are fatal for the whole batch; everything after that is decided
//! per device, so one bad board never stops the others:
//!
//! 1. environment preflight
//! 2. print-status gate
//! 3. validation: excluded, blocked, cached config, chip, config age
//! 4. version check: boards already running the host's Klipper version
//!    can be left out, after asking
//! 5. live device resolution with duplicate-target detection
//! 6. USB descriptor identity check
//! 7. build, one device at a time, output captured
//! 8. flash inside the service guard, then wait for the board to return
//! 9. summary
//!
//! Devices are processed in registry key order.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use kflash_core::kconfig::{self, ConfigCache};
use kflash_core::models::{BatchDeviceResult, SkipReason};
use kflash_core::registry::RegistrySnapshot;
use kflash_core::versions;
use log::{debug, info, warn};

use crate::build::{BuildMode, FirmwareBuilder};
use crate::error::{FlashError, Result};
use crate::flasher::{DualFlasher, FlashRequest};
use crate::guard::with_service_stopped;
use crate::preflight::check_environment;
use crate::report::render_summary;
use crate::safety::check_print_status;
use crate::validate::{checked_config, identity_mismatch, locate};
use crate::verify::wait_for_runtime;
use crate::{Host, Timing};

/// Outcome of a batch run
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// One entry per registered device, in key order
    pub results: Vec<BatchDeviceResult>,
    /// The run was cut short by the user
    pub interrupted: bool,
}

impl BatchReport {
    /// 0 when every device succeeded or was skipped on purpose, 130 on
    /// interrupt, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        if self.interrupted {
            130
        } else if self.results.iter().any(|r| r.is_failure()) {
            1
        } else {
            0
        }
    }

    /// Keys of the devices that were flashed successfully
    pub fn flashed_keys(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| r.flash_ok == Some(true))
            .map(|r| r.device_key.as_str())
            .collect()
    }
}

/// Runs the flash-all flow
pub struct BatchOrchestrator<'a> {
    host: Host<'a>,
    timing: Timing,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> BatchOrchestrator<'a> {
    /// Orchestrator over `host`
    pub fn new(host: Host<'a>, timing: Timing) -> Self {
        Self {
            host,
            timing,
            cancel: None,
        }
    }

    /// Stop between steps once `flag` is set
    pub fn with_cancel(mut self, flag: &'a AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_some_and(|f| f.load(Ordering::SeqCst))
    }

    /// Flash every eligible device in `snapshot`
    ///
    /// Errors are batch-fatal conditions only; per-device failures end up
    /// in the report.
    pub fn run(&self, snapshot: &RegistrySnapshot) -> Result<BatchReport> {
        let console = self.host.console;

        console.phase("Preflight", "Checking build environment...");
        check_environment(&snapshot.global, self.host.runner).report(console)?;
        check_print_status(self.host.status, console)?;

        let mut results: Vec<BatchDeviceResult> = snapshot
            .devices
            .iter()
            .map(|(key, entry)| BatchDeviceResult::new(key, &entry.name))
            .collect();

        let cache = ConfigCache::from_registry(snapshot);
        self.validate(snapshot, &cache, &mut results);
        self.check_versions(snapshot, &mut results);
        self.resolve(snapshot, &mut results);

        let mut report = BatchReport {
            results,
            interrupted: false,
        };

        let staging = tempfile::tempdir()
            .map_err(|e| kflash_core::Error::io(std::env::temp_dir(), e))?;
        let firmware = self.build_all(snapshot, &cache, staging.path(), &mut report);
        if !report.interrupted {
            self.flash_all(snapshot, &firmware, &mut report);
        }

        render_summary(console, &report.results);
        Ok(report)
    }

    fn validate(
        &self,
        snapshot: &RegistrySnapshot,
        cache: &ConfigCache,
        results: &mut [BatchDeviceResult],
    ) {
        let console = self.host.console;
        console.phase("Validate", "Checking device configurations...");

        for result in results.iter_mut() {
            let key = result.device_key.clone();
            let Some(entry) = snapshot.get(&key) else {
                continue;
            };

            if !entry.flashable {
                console.info(&format!("{}: excluded, skipping", entry.name));
                result.skip(SkipReason::Excluded, "Excluded from flashing");
                continue;
            }
            if let Some(reason) = snapshot.pattern_is_blocked(&entry.serial_pattern) {
                console.info(&format!("{}: blocked ({}), skipping", entry.name, reason));
                result.skip(SkipReason::Blocked, reason);
                continue;
            }

            if let Err(e) = checked_config(cache, &key, entry) {
                let reason = match e {
                    FlashError::MissingConfig(_) => SkipReason::MissingConfig,
                    FlashError::ChipMismatch { .. } => SkipReason::ChipMismatch,
                    _ => SkipReason::CorruptConfig,
                };
                console.error(&format!("{}: {}", entry.name, e));
                result.skip(reason, e.to_string());
                continue;
            }

            if let Some(age) = cache.age(&key) {
                let text = kconfig::format_age(age);
                if kconfig::is_stale(age) {
                    console.warn(&format!("{}: config last modified {}", entry.name, text));
                } else {
                    console.info(&format!("{}: config last modified {}", entry.name, text));
                }
            }
        }
    }

    fn check_versions(&self, snapshot: &RegistrySnapshot, results: &mut [BatchDeviceResult]) {
        let console = self.host.console;
        let active: Vec<usize> = (0..results.len())
            .filter(|&i| results[i].is_active())
            .collect();
        if active.is_empty() {
            return;
        }

        let host_version =
            versions::host_version(self.host.runner, &snapshot.global.klipper_path());
        let (Some(host_version), Some(mcu_versions)) = (host_version, self.host.status.mcu_versions())
        else {
            console.warn("Version check unavailable. Flashing all devices.");
            return;
        };
        console.phase("Version", &format!("Host Klipper: {}", host_version));

        let (current, outdated): (Vec<usize>, Vec<usize>) = active.into_iter().partition(|&i| {
            snapshot
                .get(&results[i].device_key)
                .and_then(|entry| versions::version_for_mcu(&mcu_versions, &entry.mcu))
                .is_some_and(|v| !versions::is_outdated(&host_version, v))
        });
        if current.is_empty() {
            return;
        }

        let skip_current = if outdated.is_empty() {
            console.phase("Version", "All devices already match host version.");
            let skip = !console.confirm("Flash anyway?", false);
            if skip {
                console.phase("Version", "Cancelled, firmware already current");
            }
            skip
        } else {
            console.phase("Version", "Outdated devices:");
            for &i in &outdated {
                console.info(&format!("  - {} ({})", results[i].device_name, results[i].device_key));
            }
            console.phase("Version", "Up-to-date devices:");
            for &i in &current {
                console.info(&format!("  - {} ({})", results[i].device_name, results[i].device_key));
            }
            console.confirm("Flash only outdated devices?", true)
        };

        if skip_current {
            for i in current {
                results[i].skip(
                    SkipReason::UpToDate,
                    format!("Firmware already at {}", host_version),
                );
            }
        }
    }

    fn resolve(&self, snapshot: &RegistrySnapshot, results: &mut [BatchDeviceResult]) {
        let console = self.host.console;
        let usb = self.host.usb;
        let devices = usb.scan();
        debug!("{} serial device(s) connected", devices.len());

        // Canonical path -> display name of the device that claimed it
        let mut claimed: HashMap<PathBuf, String> = HashMap::new();

        for result in results.iter_mut().filter(|r| r.is_active()) {
            let Some(entry) = snapshot.get(&result.device_key) else {
                continue;
            };

            let device = match locate(snapshot, &result.device_key, entry, &devices) {
                Ok(device) => device,
                Err(e) => {
                    let reason = match e {
                        FlashError::Blocked { .. } => SkipReason::Blocked,
                        FlashError::Ambiguous { .. } => SkipReason::Ambiguous,
                        _ => SkipReason::NotConnected,
                    };
                    if reason.is_intentional() {
                        console.info(&format!("{}: {}", entry.name, e));
                    } else {
                        console.warn(&format!("{}: {}", entry.name, e));
                    }
                    result.skip(reason, e.to_string());
                    continue;
                }
            };

            let canonical = usb
                .canonical_path(&device.path)
                .unwrap_or_else(|_| device.path.clone());
            if let Some(owner) = claimed.get(&canonical) {
                let message = format!(
                    "Same physical device as {} ({}), skipping",
                    owner,
                    canonical.display()
                );
                console.warn(&format!("{}: {}", entry.name, message));
                result.skip(SkipReason::DuplicateTarget, message);
                continue;
            }

            if let Some(actual) = identity_mismatch(entry, device) {
                let message = format!(
                    "Connected device reports {}, registry expects {}",
                    actual, entry.mcu
                );
                console.warn(&format!("{}: {}, skipping", entry.name, message));
                result.skip(SkipReason::IdentityMismatch, message);
                continue;
            }

            claimed.insert(canonical, entry.name.clone());
            result.device_path = Some(device.path.clone());
        }
    }

    fn build_all(
        &self,
        snapshot: &RegistrySnapshot,
        cache: &ConfigCache,
        staging: &Path,
        report: &mut BatchReport,
    ) -> HashMap<String, PathBuf> {
        let console = self.host.console;
        let klipper = snapshot.global.klipper_path();
        let builder =
            FirmwareBuilder::new(self.host.runner, &klipper).timeout(self.timing.build_timeout);
        let mut firmware = HashMap::new();

        for i in 0..report.results.len() {
            if !report.results[i].is_active() {
                continue;
            }
            if self.cancelled() {
                interrupt_remaining(&mut report.results[i..], "build");
                report.interrupted = true;
                break;
            }
            let result = &mut report.results[i];
            let key = result.device_key.clone();
            console.phase("Build", &format!("Building {}...", result.device_name));

            if let Err(e) = cache.install(&key, &klipper) {
                console.error(&format!("{}: {}", result.device_name, e));
                result.build_ok = Some(false);
                result.error_message = Some(e.to_string());
                continue;
            }

            console.begin_activity(&format!("Building {}", result.device_name));
            let build = builder.build(BuildMode::Capture);
            console.end_activity();

            if !build.success {
                let message = build
                    .error_message
                    .unwrap_or_else(|| "Build failed".to_string());
                console.error(&format!("{}: {}", result.device_name, message));
                result.build_ok = Some(false);
                result.error_message = Some(message);
                result.error_output = build.error_output;
                continue;
            }

            match stage_firmware(build.firmware_path.as_deref(), staging, &key) {
                Ok(path) => {
                    console.success(&format!(
                        "{}: built in {:.1}s",
                        result.device_name,
                        build.elapsed.as_secs_f64()
                    ));
                    result.build_ok = Some(true);
                    firmware.insert(key, path);
                }
                Err(e) => {
                    console.error(&format!("{}: {}", result.device_name, e));
                    result.build_ok = Some(false);
                    result.error_message = Some(e.to_string());
                }
            }
        }
        firmware
    }

    fn flash_all(
        &self,
        snapshot: &RegistrySnapshot,
        firmware: &HashMap<String, PathBuf>,
        report: &mut BatchReport,
    ) {
        let console = self.host.console;
        let global = &snapshot.global;
        let flasher = DualFlasher::new(
            self.host.runner,
            self.host.usb,
            console,
            global.klipper_path(),
            global.katapult_path(),
        )
        .timeout(self.timing.flash_timeout)
        .probe_timing(self.timing.probe);
        let verify_timeout = self.timing.verify_timeout.max(global.return_timeout());

        let mut flashed_any = false;
        for i in 0..report.results.len() {
            if report.results[i].build_ok != Some(true) || !report.results[i].is_active() {
                continue;
            }
            if self.cancelled() {
                interrupt_remaining(&mut report.results[i..], "flash");
                report.interrupted = true;
                break;
            }
            if flashed_any && !global.stagger().is_zero() {
                debug!("Stagger delay {:?}", global.stagger());
                thread::sleep(global.stagger());
            }
            flashed_any = true;

            let result = &mut report.results[i];
            let (Some(entry), Some(device), Some(image)) = (
                snapshot.get(&result.device_key),
                result.device_path.clone(),
                firmware.get(&result.device_key),
            ) else {
                continue;
            };

            console.phase("Flash", &format!("Flashing {}...", entry.name));
            let request = FlashRequest {
                device_path: &device,
                firmware: image,
                preferred: snapshot.flash_method_for(entry),
                allow_fallback: global.allow_flash_fallback,
                probe_first: None,
            };

            let guarded = with_service_stopped(self.host.service, console, || -> Result<_> {
                let flash = flasher.flash(&request)?;
                let verified = flash.success.then(|| {
                    console.phase("Verify", &format!("Waiting for {}...", entry.name));
                    wait_for_runtime(
                        self.host.usb,
                        &entry.serial_pattern,
                        self.timing.verify_interval,
                        verify_timeout,
                    )
                });
                Ok((flash, verified))
            });

            match guarded {
                Err(e) => {
                    console.error(&format!("{}: {}", entry.name, e));
                    result.flash_ok = Some(false);
                    result.error_message = Some(e.to_string());
                }
                Ok(guarded) => match guarded.value {
                    Err(e) => {
                        console.error(&format!("{}: {}", entry.name, e));
                        result.flash_ok = Some(false);
                        result.error_message = Some(e.to_string());
                    }
                    Ok((flash, _)) if !flash.success => {
                        let message = flash
                            .error_message
                            .unwrap_or_else(|| "Flash failed".to_string());
                        console.error(&format!("{}: flash failed: {}", entry.name, message));
                        result.flash_ok = Some(false);
                        result.error_message = Some(message);
                    }
                    Ok((flash, verified)) => {
                        result.flash_ok = Some(true);
                        result.flash_method = Some(flash.method);
                        match verified {
                            Some(Err(reason)) => {
                                console.error(&format!("{}: {}", entry.name, reason));
                                result.verify_ok = Some(false);
                                result.error_message = Some(reason);
                            }
                            Some(Ok(path)) => {
                                info!("{} back at {}", entry.name, path.display());
                                console.success(&format!(
                                    "{}: flashed via {} and verified",
                                    entry.name, flash.method
                                ));
                                result.verify_ok = Some(true);
                                result.device_path = Some(path);
                            }
                            None => {}
                        }
                    }
                },
            }
        }
    }
}

fn interrupt_remaining(results: &mut [BatchDeviceResult], stage: &str) {
    warn!("Interrupted before {} stage completed", stage);
    for result in results.iter_mut().filter(|r| r.is_active()) {
        result.skip(
            SkipReason::Interrupted,
            format!("Interrupted before {}", stage),
        );
    }
}

fn stage_firmware(built: Option<&Path>, staging: &Path, key: &str) -> Result<PathBuf> {
    let built = built.ok_or_else(|| FlashError::Build("no firmware image produced".into()))?;
    let dir = staging.join(key);
    fs::create_dir_all(&dir).map_err(|e| kflash_core::Error::io(&dir, e))?;
    let dst = dir.join("klipper.bin");
    fs::copy(built, &dst).map_err(|e| kflash_core::Error::io(&dst, e))?;
    Ok(dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeTiming;
    use kflash_core::registry::DeviceEntry;
    use kflash_dummy::{
        FakeService, FakeUsbBus, FixedStatus, RecordingConsole, Reply, ScriptedRunner,
    };
    use std::time::Duration;

    const OCTOPUS: &str = "usb-Klipper_stm32h723xx_29001A001151313531383332-if00";
    const EBB: &str = "usb-Klipper_rp2040_E66138935F253A2C-if00";

    struct Fixture {
        root: tempfile::TempDir,
        snapshot: RegistrySnapshot,
        runner: ScriptedRunner,
        usb: FakeUsbBus,
        service: FakeService,
        console: RecordingConsole,
        status: FixedStatus,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            let klipper = root.path().join("klipper");
            let katapult = root.path().join("katapult");
            fs::create_dir_all(&klipper).unwrap();
            fs::write(klipper.join("Makefile"), "all:\n").unwrap();
            fs::create_dir_all(katapult.join("scripts")).unwrap();
            fs::write(katapult.join("scripts/flashtool.py"), "").unwrap();

            let mut snapshot = RegistrySnapshot::default();
            snapshot.global.klipper_dir = klipper.clone();
            snapshot.global.katapult_dir = katapult;
            snapshot.global.config_cache_dir = root.path().join("configs");
            snapshot.global.stagger_delay = 0.0;
            snapshot.global.return_delay = 0.0;

            let runner = ScriptedRunner::new();
            runner.on("make --version", Reply::ok_with("GNU Make 4.3"));
            runner.on("sudo -n true", Reply::ok());
            runner.on("make clean", Reply::ok());
            let out = klipper.clone();
            runner.on_with("make -j", Reply::ok(), move |_| {
                fs::create_dir_all(out.join("out")).unwrap();
                fs::write(out.join("out/klipper.bin"), b"firmware").unwrap();
            });
            runner.on("flashtool.py -d", Reply::ok());

            Self {
                root,
                snapshot,
                runner,
                usb: FakeUsbBus::new(),
                service: FakeService::new(),
                console: RecordingConsole::new(),
                status: FixedStatus::idle(),
            }
        }

        fn device(&mut self, key: &str, mcu: &str, pattern: &str, config_mcu: Option<&str>) {
            self.snapshot.devices.insert(
                key.to_string(),
                DeviceEntry {
                    name: key.to_uppercase(),
                    mcu: mcu.into(),
                    serial_pattern: pattern.into(),
                    flash_method: None,
                    flashable: true,
                    config_path: None,
                    last_flashed: None,
                },
            );
            if let Some(chip) = config_mcu {
                let dir = self.root.path().join("configs").join(key);
                fs::create_dir_all(&dir).unwrap();
                fs::write(dir.join(".config"), format!("CONFIG_MCU=\"{}\"\n", chip)).unwrap();
            }
        }

        fn run(&self) -> Result<BatchReport> {
            let host = Host {
                runner: &self.runner,
                usb: &self.usb,
                service: &self.service,
                status: &self.status,
                console: &self.console,
            };
            BatchOrchestrator::new(host, fast()).run(&self.snapshot)
        }
    }

    fn fast() -> Timing {
        Timing {
            probe: ProbeTiming {
                entry_timeout: Duration::from_millis(10),
                poll_interval: Duration::from_millis(1),
                poll_timeout: Duration::from_millis(5),
                settle_delay: Duration::ZERO,
            },
            verify_interval: Duration::from_millis(1),
            verify_timeout: Duration::from_millis(5),
            ..Timing::default()
        }
    }

    fn result<'r>(report: &'r BatchReport, key: &str) -> &'r BatchDeviceResult {
        report
            .results
            .iter()
            .find(|r| r.device_key == key)
            .unwrap()
    }

    #[test]
    fn test_success_and_missing_config() {
        let mut f = Fixture::new();
        f.device("a", "stm32h723", "usb-Klipper_stm32h723xx_29001A*", Some("stm32h723xx"));
        f.device("b", "rp2040", "usb-Klipper_rp2040_E661*", None);
        f.usb.add(OCTOPUS);
        f.usb.add(EBB);

        let report = f.run().unwrap();
        let a = result(&report, "a");
        assert_eq!(a.build_ok, Some(true));
        assert_eq!(a.flash_ok, Some(true));
        assert_eq!(a.verify_ok, Some(true));
        assert!(a.succeeded());

        let b = result(&report, "b");
        assert!(b.skipped);
        assert_eq!(b.skip_reason, Some(SkipReason::MissingConfig));
        assert_eq!(b.state(), "missing configuration");
        assert_eq!(b.build_ok, None);

        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.flashed_keys(), vec!["a"]);
        assert_eq!(f.runner.count("flashtool.py -d"), 1);
        assert_eq!(f.service.calls(), vec!["service stop", "service start"]);
    }

    #[test]
    fn test_all_success_exits_zero() {
        let mut f = Fixture::new();
        f.device("a", "stm32h723", "usb-Klipper_stm32h723xx_29001A*", Some("stm32h723xx"));
        f.device("off", "rp2040", "usb-Klipper_rp2040_E661*", Some("rp2040"));
        f.snapshot.devices.get_mut("off").unwrap().flashable = false;
        f.usb.add(OCTOPUS);
        f.usb.add(EBB);

        let report = f.run().unwrap();
        assert_eq!(result(&report, "off").skip_reason, Some(SkipReason::Excluded));
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn test_chip_mismatch_never_flashes() {
        let mut f = Fixture::new();
        f.device("a", "stm32h723", "usb-Klipper_stm32h723xx_29001A*", Some("stm32f446xx"));
        f.usb.add(OCTOPUS);

        let report = f.run().unwrap();
        let a = result(&report, "a");
        assert_eq!(a.skip_reason, Some(SkipReason::ChipMismatch));
        let message = a.error_message.as_deref().unwrap();
        assert!(message.contains("stm32h723") && message.contains("stm32f446xx"));
        assert!(!f.runner.called("flashtool.py -d"));
        assert!(!f.runner.called("FLASH_DEVICE"));
        assert!(f.service.calls().is_empty());
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_duplicate_physical_target() {
        let mut f = Fixture::new();
        let alias = "usb-Klipper_stm32h723xx_29001A001151313531383332-if00-alias";
        f.device("a", "stm32h723", "usb-Klipper_stm32h723xx_29001A*-if00", Some("stm32h723xx"));
        f.device("b", "stm32h723", "usb-Klipper_stm32h723xx_29001A*-alias", Some("stm32h723xx"));
        f.usb.add(OCTOPUS);
        f.usb.add(alias);
        f.usb.set_canonical(OCTOPUS, "/dev/ttyACM0");
        f.usb.set_canonical(alias, "/dev/ttyACM0");

        let report = f.run().unwrap();
        assert!(result(&report, "a").succeeded());
        let b = result(&report, "b");
        assert_eq!(b.skip_reason, Some(SkipReason::DuplicateTarget));
        assert!(b.error_message.as_deref().unwrap().contains("/dev/ttyACM0"));
        assert_eq!(f.runner.count("flashtool.py -d"), 1);
    }

    #[test]
    fn test_identity_mismatch_skips() {
        let mut f = Fixture::new();
        f.device("a", "stm32h723", "usb-Klipper_rp2040_E661*", Some("stm32h723xx"));
        f.usb.add(EBB);

        let report = f.run().unwrap();
        assert_eq!(result(&report, "a").skip_reason, Some(SkipReason::IdentityMismatch));
        assert!(!f.runner.called("make -j"));
    }

    #[test]
    fn test_build_failure_summary_shows_twenty_lines() {
        let mut f = Fixture::new();
        f.device("a", "stm32h723", "usb-Klipper_stm32h723xx_29001A*", Some("stm32h723xx"));
        f.usb.add(OCTOPUS);
        let text: String = (1..=500).map(|i| format!("error line {}\n", i)).collect();
        let runner = ScriptedRunner::new();
        runner.on("make --version", Reply::ok());
        runner.on("sudo -n true", Reply::ok());
        runner.on("make clean", Reply::ok());
        runner.on("make -j", Reply::fail_with_stdout(2, text));
        f.runner = runner;

        let report = f.run().unwrap();
        let a = result(&report, "a");
        assert_eq!(a.build_ok, Some(false));
        assert_eq!(a.error_output.as_deref().unwrap().lines().count(), 200);
        assert_eq!(a.state(), "build failed");

        let shown: Vec<String> = f
            .console
            .lines()
            .into_iter()
            .filter(|l| l.starts_with("info:   error line "))
            .collect();
        assert_eq!(shown.len(), 20);
        assert_eq!(shown[0], "info:   error line 481");
        assert!(f.service.calls().is_empty());
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_flash_failure_restarts_service() {
        let mut f = Fixture::new();
        f.snapshot.global.allow_flash_fallback = false;
        f.device("a", "stm32h723", "usb-Klipper_stm32h723xx_29001A*", Some("stm32h723xx"));
        f.usb.add(OCTOPUS);
        let runner = ScriptedRunner::new();
        runner.on("make --version", Reply::ok());
        runner.on("sudo -n true", Reply::ok());
        runner.on("make clean", Reply::ok());
        let out = f.snapshot.global.klipper_dir.clone();
        runner.on_with("make -j", Reply::ok(), move |_| {
            fs::create_dir_all(out.join("out")).unwrap();
            fs::write(out.join("out/klipper.bin"), b"fw").unwrap();
        });
        runner.on("flashtool.py -d", Reply::fail(1, "Error: no response from bootloader"));
        f.runner = runner;

        let report = f.run().unwrap();
        let a = result(&report, "a");
        assert_eq!(a.flash_ok, Some(false));
        assert_eq!(a.state(), "flash failed");
        assert_eq!(a.error_message.as_deref(), Some("Error: no response from bootloader"));
        assert_eq!(f.service.calls(), vec!["service stop", "service start"]);
    }

    #[test]
    fn test_printer_busy_aborts() {
        let mut f = Fixture::new();
        f.device("a", "stm32h723", "usb-Klipper_stm32h723xx_29001A*", Some("stm32h723xx"));
        f.usb.add(OCTOPUS);
        f.status = FixedStatus::printing("benchy.gcode", 0.5);

        let err = f.run().unwrap_err();
        assert!(matches!(err, FlashError::PrinterBusy { percent: 50, .. }));
        assert!(!f.runner.called("make clean"));
        assert!(f.service.calls().is_empty());
    }

    #[test]
    fn test_unreachable_status_declined_aborts() {
        let mut f = Fixture::new();
        f.device("a", "stm32h723", "usb-Klipper_stm32h723xx_29001A*", Some("stm32h723xx"));
        f.status = FixedStatus::unreachable();
        f.console.answer(false);

        let err = f.run().unwrap_err();
        assert!(matches!(err, FlashError::SafetyDeclined));
        assert!(!f.runner.called("make clean"));
    }

    #[test]
    fn test_preflight_failure_aborts() {
        let mut f = Fixture::new();
        f.device("a", "stm32h723", "usb-Klipper_stm32h723xx_29001A*", Some("stm32h723xx"));
        fs::remove_file(f.snapshot.global.katapult_dir.join("scripts/flashtool.py")).unwrap();

        let err = f.run().unwrap_err();
        assert!(matches!(err, FlashError::Preflight(_)));
        assert!(!f.runner.called("make clean"));
    }

    #[test]
    fn test_interrupt_marks_remaining() {
        let mut f = Fixture::new();
        f.device("a", "stm32h723", "usb-Klipper_stm32h723xx_29001A*", Some("stm32h723xx"));
        f.usb.add(OCTOPUS);
        let flag = AtomicBool::new(true);
        let host = Host {
            runner: &f.runner,
            usb: &f.usb,
            service: &f.service,
            status: &f.status,
            console: &f.console,
        };

        let report = BatchOrchestrator::new(host, fast())
            .with_cancel(&flag)
            .run(&f.snapshot)
            .unwrap();
        assert!(report.interrupted);
        assert_eq!(result(&report, "a").skip_reason, Some(SkipReason::Interrupted));
        assert_eq!(report.exit_code(), 130);
        assert!(!f.runner.called("make clean"));
    }

    fn scripted_git(runner: &ScriptedRunner, version: &str) {
        runner.on("git describe", Reply::ok_with(version));
    }

    #[test]
    fn test_version_check_flashes_only_outdated() {
        let mut f = Fixture::new();
        f.device("a", "stm32h723", "usb-Klipper_stm32h723xx_29001A*", Some("stm32h723xx"));
        f.device("b", "rp2040", "usb-Klipper_rp2040_E661*", Some("rp2040"));
        f.usb.add(OCTOPUS);
        f.usb.add(EBB);
        scripted_git(&f.runner, "v0.12.0-45-g7ce409d");
        f.status = FixedStatus::idle()
            .with_versions(&[("main", "v0.12.0-40-gabc1234"), ("rp2040", "v0.12.0-45-g7ce409d")]);

        let report = f.run().unwrap();
        assert!(result(&report, "a").succeeded());
        let b = result(&report, "b");
        assert_eq!(b.skip_reason, Some(SkipReason::UpToDate));
        assert_eq!(b.state(), "up to date");
        assert_eq!(f.runner.count("flashtool.py -d"), 1);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(f.console.prompts(), vec!["Flash only outdated devices?"]);
    }

    #[test]
    fn test_version_check_all_current_declined() {
        let mut f = Fixture::new();
        f.device("a", "stm32h723", "usb-Klipper_stm32h723xx_29001A*", Some("stm32h723xx"));
        f.usb.add(OCTOPUS);
        scripted_git(&f.runner, "v0.12.0-45-g7ce409d");
        f.status = FixedStatus::idle().with_versions(&[("main", "v0.12.0-45-g7ce409d")]);
        f.console.answer(false);

        let report = f.run().unwrap();
        assert_eq!(result(&report, "a").skip_reason, Some(SkipReason::UpToDate));
        assert!(!f.runner.called("make clean"));
        assert!(f.service.calls().is_empty());
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn test_version_check_all_current_flash_anyway() {
        let mut f = Fixture::new();
        f.device("a", "stm32h723", "usb-Klipper_stm32h723xx_29001A*", Some("stm32h723xx"));
        f.usb.add(OCTOPUS);
        scripted_git(&f.runner, "v0.12.0-45-g7ce409d");
        f.status = FixedStatus::idle().with_versions(&[("main", "v0.12.0-45-g7ce409d")]);
        f.console.answer(true);

        let report = f.run().unwrap();
        assert!(result(&report, "a").succeeded());
    }

    #[test]
    fn test_version_check_unavailable_flashes_all() {
        let mut f = Fixture::new();
        f.device("a", "stm32h723", "usb-Klipper_stm32h723xx_29001A*", Some("stm32h723xx"));
        f.usb.add(OCTOPUS);
        scripted_git(&f.runner, "v0.12.0-45-g7ce409d");

        let report = f.run().unwrap();
        assert!(result(&report, "a").succeeded());
        assert!(f
            .console
            .warnings()
            .iter()
            .any(|w| w.contains("Version check unavailable")));
        assert!(f.console.prompts().is_empty());
    }
}
