//! Single-device flows: interactive flash and bootloader check

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use kflash_core::discovery::SerialDevice;
use kflash_core::kconfig::{self, ConfigCache};
use kflash_core::models::{BootloaderCheckResult, FlashResult};
use kflash_core::registry::{DeviceEntry, RegistrySnapshot};
use log::info;

use crate::build::{BuildMode, FirmwareBuilder};
use crate::error::{FlashError, Result};
use crate::flasher::{DualFlasher, FlashRequest};
use crate::guard::{with_service_stopped, RestartFailure};
use crate::preflight::check_environment;
use crate::probe::BootloaderProbe;
use crate::safety::check_print_status;
use crate::validate::{checked_config, identity_mismatch, locate};
use crate::verify::wait_for_runtime;
use crate::{Host, Timing};

/// Switches for [`SingleDeviceFlow::flash`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleFlashOptions {
    /// Run `make menuconfig` before building and cache the result
    pub menuconfig: bool,
    /// Probe for the Katapult bootloader before choosing a method
    pub probe_first: bool,
}

/// Outcome of a single-device flash
#[derive(Debug)]
pub struct SingleFlashReport {
    /// Transfer result; always successful, failures are errors
    pub flash: FlashResult,
    /// Device path the firmware was written to
    pub device_path: PathBuf,
    /// Runtime path after the board came back, or why it did not
    pub verified: std::result::Result<PathBuf, String>,
    /// Set if the service could not be restarted
    pub restart_failure: Option<RestartFailure>,
}

/// Flash or probe one registered device
pub struct SingleDeviceFlow<'a> {
    host: Host<'a>,
    timing: Timing,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> SingleDeviceFlow<'a> {
    /// Flow over `host`
    pub fn new(host: Host<'a>, timing: Timing) -> Self {
        Self {
            host,
            timing,
            cancel: None,
        }
    }

    /// Abort between steps once `flag` is set
    pub fn with_cancel(mut self, flag: &'a AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }

    fn checkpoint(&self) -> Result<()> {
        match self.cancel {
            Some(flag) if flag.load(Ordering::SeqCst) => Err(FlashError::Interrupted),
            _ => Ok(()),
        }
    }

    /// Find the live device for `key`, refusing excluded and blocked boards
    fn target<'s>(
        &self,
        snapshot: &'s RegistrySnapshot,
        key: &str,
    ) -> Result<(&'s DeviceEntry, SerialDevice)> {
        let entry = snapshot.require(key)?;
        if !entry.flashable {
            return Err(FlashError::Excluded(key.to_string()));
        }
        if let Some(reason) = snapshot.pattern_is_blocked(&entry.serial_pattern) {
            return Err(FlashError::Blocked {
                key: key.to_string(),
                reason,
            });
        }
        let devices = self.host.usb.scan();
        let device = locate(snapshot, key, entry, &devices)?.clone();
        info!("{} resolved to {}", key, device.path.display());
        Ok((entry, device))
    }

    /// Build and flash one device, then wait for it to come back
    pub fn flash(
        &self,
        snapshot: &RegistrySnapshot,
        key: &str,
        options: SingleFlashOptions,
    ) -> Result<SingleFlashReport> {
        let console = self.host.console;
        let global = &snapshot.global;
        let klipper = global.klipper_path();

        console.phase("Preflight", "Checking build environment...");
        check_environment(global, self.host.runner).report(console)?;

        let (entry, device) = self.target(snapshot, key)?;
        console.phase("Discovery", &format!("{}: {}", entry.name, device.filename));
        check_print_status(self.host.status, console)?;

        let cache = ConfigCache::from_registry(snapshot);
        let builder =
            FirmwareBuilder::new(self.host.runner, &klipper).timeout(self.timing.build_timeout);

        if options.menuconfig {
            if cache.load(key)?.is_some() {
                cache.install(key, &klipper)?;
            }
            let saved = builder.menuconfig(&klipper.join(".config"), console)?;
            if saved {
                cache.save_from(key, &klipper)?;
                console.phase("Config", &format!("Saved configuration for {}", entry.name));
            } else {
                console.phase("Config", "Configuration unchanged");
            }
        }

        checked_config(&cache, key, entry)?;
        if let Some(age) = cache.age(key) {
            let text = kconfig::format_age(age);
            if kconfig::is_stale(age) {
                console.warn(&format!("Config last modified {}", text));
            } else {
                console.phase("Config", &format!("Last modified {}", text));
            }
        }

        if let Some(actual) = identity_mismatch(entry, &device) {
            console.warn(&format!(
                "Connected device reports {}, registry expects {}",
                actual, entry.mcu
            ));
            if !console.confirm("Flash anyway?", false) {
                return Err(FlashError::IdentityDeclined {
                    expected: entry.mcu.clone(),
                    actual,
                });
            }
        }

        self.checkpoint()?;
        cache.install(key, &klipper)?;
        console.phase("Build", &format!("Building firmware for {}...", entry.name));
        let build = builder.build(BuildMode::Stream);
        if !build.success {
            return Err(FlashError::Build(
                build
                    .error_message
                    .unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        let firmware = build
            .firmware_path
            .unwrap_or_else(|| builder.firmware_path());
        console.success(&format!(
            "Built {} ({} bytes) in {:.1}s",
            firmware.display(),
            build.firmware_size.unwrap_or(0),
            build.elapsed.as_secs_f64()
        ));

        self.checkpoint()?;
        let flasher = DualFlasher::new(
            self.host.runner,
            self.host.usb,
            console,
            &klipper,
            global.katapult_path(),
        )
        .timeout(self.timing.flash_timeout)
        .probe_timing(self.timing.probe);
        let request = FlashRequest {
            device_path: &device.path,
            firmware: &firmware,
            preferred: snapshot.flash_method_for(entry),
            allow_fallback: global.allow_flash_fallback,
            probe_first: options
                .probe_first
                .then_some(entry.serial_pattern.as_str()),
        };
        let verify_timeout = self.timing.verify_timeout.max(global.return_timeout());

        let guarded = with_service_stopped(self.host.service, console, || -> Result<_> {
            let flash = flasher.flash(&request)?;
            if !flash.success {
                return Err(FlashError::Flash(
                    flash
                        .error_message
                        .unwrap_or_else(|| "unknown error".to_string()),
                ));
            }
            console.phase("Verify", "Waiting for device to reconnect...");
            let verified = wait_for_runtime(
                self.host.usb,
                &entry.serial_pattern,
                self.timing.verify_interval,
                verify_timeout,
            );
            Ok((flash, verified))
        })?;

        let (flash, verified) = guarded.value?;
        match &verified {
            Ok(path) => console.success(&format!(
                "{} flashed via {} and back at {}",
                entry.name,
                flash.method,
                path.display()
            )),
            Err(reason) => console.error(&format!("{}: {}", entry.name, reason)),
        }

        Ok(SingleFlashReport {
            flash,
            device_path: device.path,
            verified,
            restart_failure: guarded.restart_failure,
        })
    }

    /// Probe whether `key` has a Katapult bootloader
    ///
    /// Runs with the service stopped. An inconclusive verdict is a normal
    /// result, not an error.
    pub fn check_bootloader(
        &self,
        snapshot: &RegistrySnapshot,
        key: &str,
    ) -> Result<BootloaderCheckResult> {
        let console = self.host.console;
        let entry = snapshot.require(key)?;
        if let Some(reason) = snapshot.pattern_is_blocked(&entry.serial_pattern) {
            return Err(FlashError::Blocked {
                key: key.to_string(),
                reason,
            });
        }
        let devices = self.host.usb.scan();
        let device = locate(snapshot, key, entry, &devices)?.clone();
        check_print_status(self.host.status, console)?;

        let probe =
            BootloaderProbe::with_timing(self.host.runner, self.host.usb, self.timing.probe);
        let katapult = snapshot.global.katapult_path();
        let guarded = with_service_stopped(self.host.service, console, || {
            let log = |m: &str| console.phase("Katapult", m);
            probe.probe(
                &device.path,
                &entry.serial_pattern,
                &katapult,
                Some(&log as &dyn Fn(&str)),
            )
        })?;
        Ok(guarded.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeTiming;
    use kflash_core::models::{BootloaderStatus, FlashMethod};
    use kflash_dummy::{
        FakeService, FakeUsbBus, FixedStatus, Journal, RecordingConsole, Reply, ScriptedRunner,
    };
    use std::fs;
    use std::time::Duration;

    const RUNTIME: &str = "usb-Klipper_stm32h723xx_29001A001151313531383332-if00";
    const BOOTLOADER: &str = "usb-katapult_stm32h723xx_29001A001151313531383332-if00";
    const PATTERN: &str = "usb-Klipper_stm32h723xx_29001A*";

    struct Fixture {
        root: tempfile::TempDir,
        snapshot: RegistrySnapshot,
        journal: Journal,
        runner: ScriptedRunner,
        usb: FakeUsbBus,
        service: FakeService,
        console: RecordingConsole,
        status: FixedStatus,
    }

    impl Fixture {
        fn new(mcu: &str, config_mcu: Option<&str>) -> Self {
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
            snapshot.global.return_delay = 0.0;
            snapshot.devices.insert(
                "octopus".into(),
                DeviceEntry {
                    name: "Octopus Pro".into(),
                    mcu: mcu.into(),
                    serial_pattern: PATTERN.into(),
                    flash_method: None,
                    flashable: true,
                    config_path: None,
                    last_flashed: None,
                },
            );
            if let Some(chip) = config_mcu {
                let dir = root.path().join("configs/octopus");
                fs::create_dir_all(&dir).unwrap();
                fs::write(dir.join(".config"), format!("CONFIG_MCU=\"{}\"\n", chip)).unwrap();
            }

            let journal = Journal::new();
            let runner = ScriptedRunner::with_journal(journal.clone());
            runner.on("make --version", Reply::ok());
            runner.on("sudo -n true", Reply::ok());
            runner.on("make clean", Reply::ok());
            let out = klipper;
            runner.on_with("make -j", Reply::ok(), move |_| {
                fs::create_dir_all(out.join("out")).unwrap();
                fs::write(out.join("out/klipper.bin"), vec![0u8; 4096]).unwrap();
            });

            Self {
                root,
                snapshot,
                service: FakeService::with_journal(journal.clone()),
                journal,
                runner,
                usb: FakeUsbBus::with_devices(&[RUNTIME]),
                console: RecordingConsole::new(),
                status: FixedStatus::idle(),
            }
        }

        fn flow(&self) -> SingleDeviceFlow<'_> {
            let host = Host {
                runner: &self.runner,
                usb: &self.usb,
                service: &self.service,
                status: &self.status,
                console: &self.console,
            };
            SingleDeviceFlow::new(host, fast())
        }
    }

    fn fast() -> Timing {
        Timing {
            probe: ProbeTiming {
                entry_timeout: Duration::from_millis(10),
                poll_interval: Duration::from_millis(1),
                poll_timeout: Duration::from_millis(10),
                settle_delay: Duration::ZERO,
            },
            verify_interval: Duration::from_millis(1),
            verify_timeout: Duration::from_millis(10),
            ..Timing::default()
        }
    }

    #[test]
    fn test_flash_builds_then_flashes_inside_guard() {
        let f = Fixture::new("stm32h723", Some("stm32h723xx"));
        f.runner.on("flashtool.py -d", Reply::ok());

        let report = f
            .flow()
            .flash(&f.snapshot, "octopus", SingleFlashOptions::default())
            .unwrap();
        assert!(report.flash.success);
        assert_eq!(report.flash.method, FlashMethod::Katapult);
        assert!(report.verified.is_ok());
        assert!(report.restart_failure.is_none());

        let build = f.journal.position("make -j").unwrap();
        let stop = f.journal.position("service stop").unwrap();
        let flash = f.journal.position("flashtool.py -d").unwrap();
        let start = f.journal.position("service start").unwrap();
        assert!(build < stop && stop < flash && flash < start);
        assert!(f.root.path().join("klipper/.config").exists());
    }

    #[test]
    fn test_flash_failure_is_error_and_service_restarts() {
        let f = Fixture::new("stm32h723", Some("stm32h723xx"));
        f.runner.on("flashtool.py -d", Reply::fail(1, "no bootloader"));
        f.runner.on("FLASH_DEVICE", Reply::fail(2, "make: *** [flash] Error 1"));

        let err = f
            .flow()
            .flash(&f.snapshot, "octopus", SingleFlashOptions::default())
            .unwrap_err();
        assert!(matches!(err, FlashError::Flash(ref m) if m.contains("Error 1")));
        assert_eq!(f.service.calls(), vec!["service stop", "service start"]);
    }

    #[test]
    fn test_lookup_errors() {
        let mut f = Fixture::new("stm32h723", Some("stm32h723xx"));
        let err = f
            .flow()
            .flash(&f.snapshot, "nope", SingleFlashOptions::default())
            .unwrap_err();
        assert!(matches!(err, FlashError::Core(kflash_core::Error::UnknownDevice(_))));

        f.usb.remove(RUNTIME);
        let err = f
            .flow()
            .flash(&f.snapshot, "octopus", SingleFlashOptions::default())
            .unwrap_err();
        assert!(matches!(err, FlashError::NotConnected(_)));

        f.snapshot.set_flashable("octopus", false).unwrap();
        let err = f
            .flow()
            .flash(&f.snapshot, "octopus", SingleFlashOptions::default())
            .unwrap_err();
        assert!(matches!(err, FlashError::Excluded(_)));
        assert!(f.service.calls().is_empty());
    }

    #[test]
    fn test_missing_config_and_chip_mismatch() {
        let f = Fixture::new("stm32h723", None);
        let err = f
            .flow()
            .flash(&f.snapshot, "octopus", SingleFlashOptions::default())
            .unwrap_err();
        assert!(matches!(err, FlashError::MissingConfig(_)));

        let f = Fixture::new("stm32h723", Some("rp2040"));
        let err = f
            .flow()
            .flash(&f.snapshot, "octopus", SingleFlashOptions::default())
            .unwrap_err();
        assert!(matches!(err, FlashError::ChipMismatch { .. }));
        assert!(!f.runner.called("make -j"));
    }

    #[test]
    fn test_identity_mismatch_needs_confirmation() {
        let f = Fixture::new("stm32f446", Some("stm32f446xx"));
        f.runner.on("flashtool.py -d", Reply::ok());
        let err = f
            .flow()
            .flash(&f.snapshot, "octopus", SingleFlashOptions::default())
            .unwrap_err();
        assert!(matches!(err, FlashError::IdentityDeclined { .. }));
        assert_eq!(f.console.prompts(), vec!["Flash anyway?"]);
        assert!(!f.runner.called("make -j"));

        f.console.answer(true);
        let report = f
            .flow()
            .flash(&f.snapshot, "octopus", SingleFlashOptions::default())
            .unwrap();
        assert!(report.flash.success);
    }

    #[test]
    fn test_menuconfig_saves_to_cache() {
        let f = Fixture::new("stm32h723", None);
        f.runner.on("flashtool.py -d", Reply::ok());
        f.runner.on_with("make menuconfig", Reply::ok(), |spec| {
            let path = &spec.env[0].1;
            fs::write(path, "CONFIG_MCU=\"stm32h723xx\"\n").unwrap();
        });

        let options = SingleFlashOptions {
            menuconfig: true,
            probe_first: false,
        };
        f.flow().flash(&f.snapshot, "octopus", options).unwrap();
        let cached = fs::read_to_string(f.root.path().join("configs/octopus/.config")).unwrap();
        assert!(cached.contains("stm32h723xx"));
    }

    #[test]
    fn test_interrupt_before_build() {
        let f = Fixture::new("stm32h723", Some("stm32h723xx"));
        let flag = AtomicBool::new(true);
        let err = f
            .flow()
            .with_cancel(&flag)
            .flash(&f.snapshot, "octopus", SingleFlashOptions::default())
            .unwrap_err();
        assert!(matches!(err, FlashError::Interrupted));
        assert!(!f.runner.called("make clean"));
    }

    #[test]
    fn test_check_bootloader_present() {
        let f = Fixture::new("stm32h723", None);
        let b = f.usb.clone();
        f.runner
            .once_with("-r -d", Reply::ok(), move |_| b.replace(RUNTIME, BOOTLOADER));
        let b = f.usb.clone();
        f.runner
            .once_with("-r -d", Reply::ok(), move |_| b.replace(BOOTLOADER, RUNTIME));

        let result = f.flow().check_bootloader(&f.snapshot, "octopus").unwrap();
        assert_eq!(result.status, BootloaderStatus::Present);
        assert!(result.note.is_none());
        assert_eq!(f.service.calls(), vec!["service stop", "service start"]);
        assert!(f.console.contains("[Katapult] Entering bootloader mode..."));
    }

    #[test]
    fn test_check_bootloader_inconclusive_still_restarts() {
        let f = Fixture::new("stm32h723", None);
        let b = f.usb.clone();
        f.runner.on_with("-r -d", Reply::ok(), move |_| b.remove(RUNTIME));

        let result = f.flow().check_bootloader(&f.snapshot, "octopus").unwrap();
        assert_eq!(result.has_bootloader(), None);
        assert!(result.error_message().unwrap().contains("manual intervention"));
        assert_eq!(f.service.count("start"), 1);
    }
}
