//! `check`: bootloader presence probe

use kflash_core::models::BootloaderStatus;
use kflash_core::registry::RegistrySnapshot;
use kflash_flash::{Host, SingleDeviceFlow, Timing};

use super::CommandResult;

/// Probe one device for Katapult; an inconclusive verdict exits 1
pub fn run_check(host: Host<'_>, snapshot: &RegistrySnapshot, key: &str) -> CommandResult {
    run_check_with(host, snapshot, key, Timing::default())
}

fn run_check_with(
    host: Host<'_>,
    snapshot: &RegistrySnapshot,
    key: &str,
    timing: Timing,
) -> CommandResult {
    let console = host.console;
    let result = SingleDeviceFlow::new(host, timing).check_bootloader(snapshot, key)?;
    let elapsed = result.elapsed.as_secs_f64();

    match &result.status {
        BootloaderStatus::Present => {
            console.success(&format!("Katapult bootloader detected ({:.1}s)", elapsed));
            if let Some(note) = &result.note {
                console.warn(note);
            }
            Ok(0)
        }
        BootloaderStatus::Absent => {
            console.info(&format!(
                "No Katapult bootloader; device recovered ({:.1}s)",
                elapsed
            ));
            Ok(0)
        }
        BootloaderStatus::Inconclusive { message } => {
            console.error(&format!("Bootloader check inconclusive: {}", message));
            Ok(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kflash_core::registry::DeviceEntry;
    use kflash_dummy::{
        FakeService, FakeUsbBus, FixedStatus, RecordingConsole, Reply, ScriptedRunner,
    };
    use kflash_flash::ProbeTiming;
    use std::fs;
    use std::time::Duration;

    const RUNTIME: &str = "usb-Klipper_rp2040_E66138935F253A2C-if00";

    #[test]
    fn test_inconclusive_exits_one() {
        let root = tempfile::tempdir().unwrap();
        let katapult = root.path().join("katapult");
        fs::create_dir_all(katapult.join("scripts")).unwrap();
        fs::write(katapult.join("scripts/flashtool.py"), "").unwrap();

        let mut snapshot = RegistrySnapshot::default();
        snapshot.global.katapult_dir = katapult;
        snapshot.devices.insert(
            "ebb".into(),
            DeviceEntry {
                name: "EBB36".into(),
                mcu: "rp2040".into(),
                serial_pattern: "usb-Klipper_rp2040_E661*".into(),
                flash_method: None,
                flashable: true,
                config_path: None,
                last_flashed: None,
            },
        );

        let usb = FakeUsbBus::with_devices(&[RUNTIME]);
        let runner = ScriptedRunner::new();
        let bus = usb.clone();
        runner.on_with("-r -d", Reply::ok(), move |_| bus.remove(RUNTIME));
        let service = FakeService::new();
        let console = RecordingConsole::new();
        let status = FixedStatus::idle();
        let host = Host {
            runner: &runner,
            usb: &usb,
            service: &service,
            status: &status,
            console: &console,
        };
        let timing = Timing {
            probe: ProbeTiming {
                entry_timeout: Duration::from_millis(10),
                poll_interval: Duration::from_millis(1),
                poll_timeout: Duration::from_millis(5),
                settle_delay: Duration::ZERO,
            },
            ..Timing::default()
        };

        let code = run_check_with(host, &snapshot, "ebb", timing).unwrap();
        assert_eq!(code, 1);
        assert!(console.errors()[0].contains("manual intervention"));
        assert_eq!(service.calls(), vec!["service stop", "service start"]);
    }
}
