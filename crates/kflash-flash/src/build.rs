//! Firmware build: `make clean`, `make -jN`, and `make menuconfig`

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use kflash_core::console::Console;
use kflash_core::models::BuildResult;
use kflash_core::process::{tail_lines, CommandOutput, CommandRunner, CommandSpec, OutputMode};
use log::{debug, info};

use crate::error::{FlashError, Result};

/// Budget for each build step
pub const BUILD_TIMEOUT: Duration = Duration::from_secs(300);

/// Lines of build output kept on failure
pub const ERROR_OUTPUT_LINES: usize = 200;

/// How build output is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// Stream to the terminal
    Stream,
    /// Capture, keeping the tail for diagnostics
    Capture,
}

/// Builds Klipper firmware in a source tree
pub struct FirmwareBuilder<'a> {
    runner: &'a dyn CommandRunner,
    klipper_dir: PathBuf,
    timeout: Duration,
    jobs: usize,
}

impl<'a> FirmwareBuilder<'a> {
    /// Builder for `klipper_dir`, one job per CPU
    pub fn new(runner: &'a dyn CommandRunner, klipper_dir: impl Into<PathBuf>) -> Self {
        let jobs = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            runner,
            klipper_dir: klipper_dir.into(),
            timeout: BUILD_TIMEOUT,
            jobs,
        }
    }

    /// Per-step timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Where a successful build leaves the image
    pub fn firmware_path(&self) -> PathBuf {
        self.klipper_dir.join("out").join("klipper.bin")
    }

    /// Run `make clean` then `make -jN`
    pub fn build(&self, mode: BuildMode) -> BuildResult {
        let start = Instant::now();
        let output_mode = match mode {
            BuildMode::Stream => OutputMode::Inherit,
            BuildMode::Capture => OutputMode::Capture,
        };

        let steps: [(Vec<String>, &str); 2] = [
            (vec!["clean".to_string()], "make clean"),
            (vec![format!("-j{}", self.jobs)], "make"),
        ];
        for (args, label) in steps {
            let spec = CommandSpec::new("make")
                .args(args)
                .cwd(&self.klipper_dir)
                .timeout(self.timeout)
                .output(output_mode);
            debug!("Build step: {}", spec.command_line());
            let output = match self.runner.run(&spec) {
                Ok(output) => output,
                Err(e) => return failed(start, e.to_string(), None),
            };
            if output.timed_out {
                return failed(
                    start,
                    format!("{} timed out after {}s", label, self.timeout.as_secs()),
                    captured_tail(mode, &output),
                );
            }
            if !output.success() {
                let status = output
                    .code
                    .map(|c| format!("exit code {}", c))
                    .unwrap_or_else(|| "a signal".to_string());
                return failed(
                    start,
                    format!("{} failed with {}", label, status),
                    captured_tail(mode, &output),
                );
            }
        }

        let firmware = self.firmware_path();
        match fs::metadata(&firmware) {
            Ok(meta) => {
                info!(
                    "Built {} ({} bytes) in {:.1}s",
                    firmware.display(),
                    meta.len(),
                    start.elapsed().as_secs_f64()
                );
                BuildResult {
                    success: true,
                    elapsed: start.elapsed(),
                    firmware_path: Some(firmware),
                    firmware_size: Some(meta.len()),
                    ..Default::default()
                }
            }
            Err(_) => failed(
                start,
                format!("Build succeeded but firmware not found: {}", firmware.display()),
                None,
            ),
        }
    }

    /// Run `make menuconfig` on `config_path` with the terminal attached
    ///
    /// Returns whether the file was saved.
    pub fn menuconfig(&self, config_path: &Path, console: &dyn Console) -> Result<bool> {
        let before = mtime(config_path);
        let spec = CommandSpec::new("make")
            .arg("menuconfig")
            .cwd(&self.klipper_dir)
            .env("KCONFIG_CONFIG", config_path.as_os_str())
            .timeout(Duration::from_secs(24 * 60 * 60))
            .output(OutputMode::Inherit);
        console.phase("Config", "Launching menuconfig...");
        let output = self
            .runner
            .run(&spec)
            .map_err(|e| FlashError::Menuconfig(e.to_string()))?;
        if !output.success() {
            return Err(FlashError::Menuconfig(output.failure_reason()));
        }
        let after = mtime(config_path);
        Ok(after.is_some() && after != before)
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn captured_tail(mode: BuildMode, output: &CommandOutput) -> Option<String> {
    match mode {
        BuildMode::Capture if !output.combined.is_empty() => {
            Some(tail_lines(&output.combined, ERROR_OUTPUT_LINES))
        }
        _ => None,
    }
}

fn failed(start: Instant, message: String, error_output: Option<String>) -> BuildResult {
    BuildResult {
        success: false,
        elapsed: start.elapsed(),
        error_message: Some(message),
        error_output,
        ..Default::default()
    }
}
