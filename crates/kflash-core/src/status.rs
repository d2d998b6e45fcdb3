//! Print-status seam
//!
//! Flashing while a print is running would kill the print, so both flash
//! paths ask a [`PrintStatusSource`] first. The same source reports which
//! firmware each MCU runs, so a batch can skip boards that are current.

use std::fmt;

use crate::versions::McuVersions;

/// Printer state as far as flashing is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrinterState {
    /// Nothing running
    Idle,
    /// Job in progress
    Printing,
    /// Job paused
    Paused,
}

impl PrinterState {
    /// Map a Moonraker `print_stats.state` string
    pub fn from_moonraker(state: &str) -> Self {
        match state {
            "printing" => PrinterState::Printing,
            "paused" => PrinterState::Paused,
            _ => PrinterState::Idle,
        }
    }

    /// A job is printing or paused
    pub fn is_busy(self) -> bool {
        !matches!(self, PrinterState::Idle)
    }
}

impl fmt::Display for PrinterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PrinterState::Idle => "idle",
            PrinterState::Printing => "printing",
            PrinterState::Paused => "paused",
        })
    }
}

/// Snapshot of the print job
#[derive(Debug, Clone, PartialEq)]
pub struct PrintStatus {
    /// Current state
    pub state: PrinterState,
    /// File being printed
    pub filename: Option<String>,
    /// Progress, 0.0 to 1.0
    pub progress: f64,
}

/// Source of print status and running firmware versions
pub trait PrintStatusSource {
    /// Current status, or `None` when the status service is unreachable
    fn get_status(&self) -> Option<PrintStatus>;

    /// Firmware version of every MCU the printer host knows, or `None` when
    /// unreachable or when no MCU reports one
    fn mcu_versions(&self) -> Option<McuVersions> {
        None
    }
}
