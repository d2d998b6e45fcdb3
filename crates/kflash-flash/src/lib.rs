//! Klipper firmware flash orchestration and bootloader recovery
//!
//! This crate is the engine behind the `kflash` CLI. The CLI only talks to
//! the flows exported here and to the registry types in `kflash-core`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         CLI (bin/kflash)                      │
//! │  - Loads the registry, builds a Host, picks a flow            │
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                  kflash-flash (this crate)                    │
//! │  BatchOrchestrator / SingleDeviceFlow                         │
//! │     ├─ preflight, print-status gate, per-device validation    │
//! │     ├─ FirmwareBuilder                                        │
//! │     └─ ServiceGuard ─▶ DualFlasher ─▶ BootloaderProbe         │
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//!               ┌───────────────┴────────────────┐
//!               ▼                                ▼
//! ┌───────────────────────────┐   ┌───────────────────────────────┐
//! │ kflash-core               │   │ Host implementations          │
//! │  - models, registry       │   │  - SystemRunner, systemd      │
//! │  - discovery, kconfig     │   │  - kflash-linux-usb           │
//! │  - host traits            │   │  - kflash-dummy (tests)       │
//! └───────────────────────────┘   └───────────────────────────────┘
//! ```
//!
//! Everything is sequential. One device is processed at a time and every
//! external command blocks until it exits or its timeout fires.

mod batch;
mod build;
mod error;
mod flasher;
mod guard;
pub mod interrupt;
mod preflight;
mod probe;
mod report;
mod safety;
mod single;
mod validate;
mod verify;

use std::time::Duration;

use kflash_core::console::Console;
use kflash_core::process::CommandRunner;
use kflash_core::service::ServiceControl;
use kflash_core::status::PrintStatusSource;
use kflash_core::usb::UsbBus;

pub use batch::{BatchOrchestrator, BatchReport};
pub use build::{BuildMode, FirmwareBuilder, BUILD_TIMEOUT, ERROR_OUTPUT_LINES};
pub use error::{FlashError, Result};
pub use flasher::{attempt_plan, DualFlasher, FlashRequest, FLASH_TIMEOUT};
pub use guard::{with_service_stopped, Guarded, RestartFailure, ServiceGuard};
pub use preflight::{check_environment, Preflight};
pub use probe::{BootloaderProbe, ProbeTiming};
pub use report::{render_summary, SUMMARY_OUTPUT_LINES};
pub use safety::check_print_status;
pub use single::{SingleDeviceFlow, SingleFlashOptions, SingleFlashReport};
pub use verify::wait_for_runtime;

/// Host services the flows run against
#[derive(Clone, Copy)]
pub struct Host<'a> {
    /// External command execution
    pub runner: &'a dyn CommandRunner,
    /// USB serial devices
    pub usb: &'a dyn UsbBus,
    /// Firmware service
    pub service: &'a dyn ServiceControl,
    /// Print-job status
    pub status: &'a dyn PrintStatusSource,
    /// User-facing output
    pub console: &'a dyn Console,
}

/// Timeouts and poll intervals
#[derive(Debug, Clone)]
pub struct Timing {
    /// Bootloader probe timing
    pub probe: ProbeTiming,
    /// Budget for each flash method
    pub flash_timeout: Duration,
    /// Budget for each build step
    pub build_timeout: Duration,
    /// Poll interval while waiting for a flashed device
    pub verify_interval: Duration,
    /// Minimum wait for a flashed device to come back
    pub verify_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            probe: ProbeTiming::default(),
            flash_timeout: FLASH_TIMEOUT,
            build_timeout: BUILD_TIMEOUT,
            verify_interval: Duration::from_millis(500),
            verify_timeout: Duration::from_secs(30),
        }
    }
}
