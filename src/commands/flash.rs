//! `flash` and `flash-all`

use chrono::Utc;
use kflash_core::registry::{Registry, RegistrySnapshot};
use kflash_flash::{
    interrupt, BatchOrchestrator, Host, SingleDeviceFlow, SingleFlashOptions, Timing,
};

use super::CommandResult;

/// Build and flash one device, then record the flash time
pub fn run_flash(
    host: Host<'_>,
    registry: &Registry,
    mut snapshot: RegistrySnapshot,
    key: &str,
    options: SingleFlashOptions,
) -> CommandResult {
    let flow = SingleDeviceFlow::new(host, Timing::default()).with_cancel(interrupt::flag());
    let report = flow.flash(&snapshot, key, options)?;

    snapshot.record_flashes([key], Utc::now());
    registry.save(&snapshot)?;

    if report.restart_failure.is_some() {
        host.console
            .warn("Firmware was flashed but the service did not restart");
    }
    Ok(if report.verified.is_ok() { 0 } else { 1 })
}

/// Flash every eligible device, then record flash times in one write
pub fn run_flash_all(
    host: Host<'_>,
    registry: &Registry,
    mut snapshot: RegistrySnapshot,
) -> CommandResult {
    if !snapshot.devices.values().any(|d| d.flashable) {
        host.console.error(&format!(
            "No flashable devices registered in {}",
            registry.path().display()
        ));
        return Ok(1);
    }

    let report = BatchOrchestrator::new(host, Timing::default())
        .with_cancel(interrupt::flag())
        .run(&snapshot)?;

    let flashed: Vec<String> = report
        .flashed_keys()
        .into_iter()
        .map(str::to_string)
        .collect();
    if !flashed.is_empty() {
        snapshot.record_flashes(flashed.iter().map(String::as_str), Utc::now());
        registry.save(&snapshot)?;
    }
    Ok(report.exit_code())
}
