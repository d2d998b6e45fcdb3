//! Environment checks run before any device is touched

use std::time::Duration;

use kflash_core::console::Console;
use kflash_core::models::FlashMethod;
use kflash_core::paths;
use kflash_core::process::{CommandRunner, CommandSpec};
use kflash_core::registry::GlobalConfig;
use kflash_core::service::passwordless_sudo;
use log::debug;

use crate::error::{FlashError, Result};

/// Outcome of [`check_environment`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preflight {
    /// Missing prerequisites; any of these aborts the run
    pub errors: Vec<String>,
    /// Problems that only degrade the run
    pub warnings: Vec<String>,
}

impl Preflight {
    /// No blocking problems found
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Print warnings and turn errors into a [`FlashError::Preflight`]
    pub fn report(self, console: &dyn Console) -> Result<()> {
        for warning in &self.warnings {
            console.warn(warning);
        }
        if self.is_ok() {
            return Ok(());
        }
        for error in &self.errors {
            console.error(error);
        }
        Err(FlashError::Preflight(self.errors))
    }
}

/// Verify the Klipper tree, its Makefile, `make`, and the Katapult flashtool
pub fn check_environment(global: &GlobalConfig, runner: &dyn CommandRunner) -> Preflight {
    check_with(global, runner, |program| paths::which(program).is_some())
}

fn check_with(
    global: &GlobalConfig,
    runner: &dyn CommandRunner,
    on_path: impl Fn(&str) -> bool,
) -> Preflight {
    let mut result = Preflight::default();

    let klipper = global.klipper_path();
    if !klipper.is_dir() {
        result
            .errors
            .push(format!("Klipper directory not found: {}", klipper.display()));
    } else if !klipper.join("Makefile").is_file() {
        result
            .errors
            .push(format!("No Makefile in Klipper directory: {}", klipper.display()));
    }

    let make = CommandSpec::new("make")
        .arg("--version")
        .timeout(Duration::from_secs(5));
    match runner.run(&make) {
        Ok(out) if out.success() => debug!("make is available"),
        Ok(out) => result
            .errors
            .push(format!("make is not usable: {}", out.failure_reason())),
        Err(e) => result.errors.push(format!("make is not available: {}", e)),
    }

    let flashtool = global.katapult_path().join("scripts").join("flashtool.py");
    if !flashtool.is_file() {
        result
            .errors
            .push(format!("Katapult flashtool not found: {}", flashtool.display()));
    }

    if !on_path("python3") {
        let message = "python3 not found in PATH (required for Katapult)".to_string();
        let katapult_only =
            global.default_flash_method == FlashMethod::Katapult && !global.allow_flash_fallback;
        if katapult_only {
            result.errors.push(message);
        } else {
            result.warnings.push(message);
        }
    }
    for tool in ["sudo", "systemctl"] {
        if !on_path(tool) {
            result
                .warnings
                .push(format!("{} not found in PATH; service control may fail", tool));
        }
    }

    if !passwordless_sudo(runner) {
        result.warnings.push(
            "Passwordless sudo is not configured; service control may prompt for a password"
                .to_string(),
        );
    }

    result
}
