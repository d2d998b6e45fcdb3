//! Result types produced by the flashing engine
//!
//! All of these are created fresh for one operation and are never persisted.
//! [`BatchDeviceResult`] is the only mutable one: the batch orchestrator
//! fills it in stage by stage and renders it once at the end.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How firmware is transferred to a board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashMethod {
    /// Katapult bootloader via `flashtool.py`
    Katapult,
    /// Klipper build system `make flash` target
    MakeFlash,
}

impl FlashMethod {
    /// The other method, used as the fallback
    pub fn other(self) -> Self {
        match self {
            FlashMethod::Katapult => FlashMethod::MakeFlash,
            FlashMethod::MakeFlash => FlashMethod::Katapult,
        }
    }

    /// Name used in the registry file and in log output
    pub fn as_str(self) -> &'static str {
        match self {
            FlashMethod::Katapult => "katapult",
            FlashMethod::MakeFlash => "make_flash",
        }
    }
}

impl fmt::Display for FlashMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FlashMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "katapult" => Ok(FlashMethod::Katapult),
            "make_flash" | "make-flash" => Ok(FlashMethod::MakeFlash),
            other => Err(format!("Unknown flash method: {}", other)),
        }
    }
}

/// Outcome of one flash attempt on one device
#[derive(Debug, Clone, PartialEq)]
pub struct FlashResult {
    /// Whether the firmware was transferred
    pub success: bool,
    /// Method that produced this result
    pub method: FlashMethod,
    /// Wall time spent, across every method tried
    pub elapsed: Duration,
    /// Failure reason from the last method tried
    pub error_message: Option<String>,
}

impl FlashResult {
    /// Successful transfer
    pub fn ok(method: FlashMethod, elapsed: Duration) -> Self {
        Self {
            success: true,
            method,
            elapsed,
            error_message: None,
        }
    }

    /// Failed transfer
    pub fn failed(method: FlashMethod, elapsed: Duration, message: impl Into<String>) -> Self {
        Self {
            success: false,
            method,
            elapsed,
            error_message: Some(message.into()),
        }
    }
}

/// Outcome of one firmware compilation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildResult {
    /// Whether `out/klipper.bin` was produced
    pub success: bool,
    /// Wall time spent in `make clean` and `make`
    pub elapsed: Duration,
    /// Short failure reason
    pub error_message: Option<String>,
    /// Tail of the captured build output; only set for failed captured builds
    pub error_output: Option<String>,
    /// Firmware image on success
    pub firmware_path: Option<PathBuf>,
    /// Firmware image size in bytes on success
    pub firmware_size: Option<u64>,
}

/// Verdict of a bootloader probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootloaderStatus {
    /// The bootloader device was observed
    Present,
    /// No bootloader; the device was recovered to runtime mode
    Absent,
    /// Neither state could be confirmed
    Inconclusive {
        /// What went wrong, and what the user should do about it
        message: String,
    },
}

/// Outcome of a bootloader probe
///
/// The probe never fails with an `Err`; [`BootloaderStatus::Inconclusive`]
/// is its only failure channel.
#[derive(Debug, Clone, PartialEq)]
pub struct BootloaderCheckResult {
    /// Tri-state verdict
    pub status: BootloaderStatus,
    /// Extra information attached to a conclusive verdict
    pub note: Option<String>,
    /// Wall time spent probing
    pub elapsed: Duration,
}

impl BootloaderCheckResult {
    /// `Some(true)` present, `Some(false)` absent, `None` inconclusive
    pub fn has_bootloader(&self) -> Option<bool> {
        match self.status {
            BootloaderStatus::Present => Some(true),
            BootloaderStatus::Absent => Some(false),
            BootloaderStatus::Inconclusive { .. } => None,
        }
    }

    /// Message accompanying an inconclusive verdict, or the note otherwise
    pub fn error_message(&self) -> Option<&str> {
        match &self.status {
            BootloaderStatus::Inconclusive { message } => Some(message),
            _ => self.note.as_deref(),
        }
    }
}

/// Why a device did not take part in a batch run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Marked non-flashable by the user
    Excluded,
    /// Matches a blocked-device pattern
    Blocked,
    /// No cached build configuration
    MissingConfig,
    /// Cached configuration could not be read or has no chip
    CorruptConfig,
    /// Cached configuration targets a different chip than the registry
    ChipMismatch,
    /// No live USB device matches the serial pattern
    NotConnected,
    /// Serial pattern matches more than one live USB device
    Ambiguous,
    /// Live path already claimed by an earlier device in this batch
    DuplicateTarget,
    /// USB descriptor names a different chip than the registry
    IdentityMismatch,
    /// User interrupted the batch before this device was reached
    Interrupted,
    /// Firmware already matches the host version and the user chose to
    /// flash only outdated boards
    UpToDate,
}

impl SkipReason {
    /// Skips the user asked for; these do not fail a batch
    pub fn is_intentional(self) -> bool {
        matches!(
            self,
            SkipReason::Excluded | SkipReason::Blocked | SkipReason::UpToDate
        )
    }

    /// Short label for the summary table
    pub fn label(self) -> &'static str {
        match self {
            SkipReason::Excluded => "excluded",
            SkipReason::Blocked => "blocked",
            SkipReason::MissingConfig => "missing configuration",
            SkipReason::CorruptConfig => "unreadable configuration",
            SkipReason::ChipMismatch => "chip mismatch",
            SkipReason::NotConnected => "not connected",
            SkipReason::Ambiguous => "ambiguous match",
            SkipReason::DuplicateTarget => "duplicate target",
            SkipReason::IdentityMismatch => "MCU mismatch",
            SkipReason::Interrupted => "interrupted",
            SkipReason::UpToDate => "up to date",
        }
    }
}

/// Per-device outcome within a batch run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchDeviceResult {
    /// Registry key
    pub device_key: String,
    /// Display name
    pub device_name: String,
    /// Set once the device leaves the batch before building
    pub skipped: bool,
    /// Why it was skipped
    pub skip_reason: Option<SkipReason>,
    /// `None` until the build stage reaches this device
    pub build_ok: Option<bool>,
    /// `None` until the flash stage reaches this device
    pub flash_ok: Option<bool>,
    /// `None` until post-flash verification has run
    pub verify_ok: Option<bool>,
    /// Method that flashed the device
    pub flash_method: Option<FlashMethod>,
    /// Failure or skip reason
    pub error_message: Option<String>,
    /// Captured build output tail, on build failure
    pub error_output: Option<String>,
    /// Live device path once resolved
    pub device_path: Option<PathBuf>,
}

impl BatchDeviceResult {
    /// Fresh result at batch start
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            device_key: key.into(),
            device_name: name.into(),
            ..Default::default()
        }
    }

    /// Mark the device as skipped
    pub fn skip(&mut self, reason: SkipReason, message: impl Into<String>) {
        self.skipped = true;
        self.skip_reason = Some(reason);
        self.error_message = Some(message.into());
    }

    /// Still eligible for the next stage
    pub fn is_active(&self) -> bool {
        !self.skipped && self.build_ok != Some(false) && self.flash_ok != Some(false)
    }

    /// Built, flashed and verified
    pub fn succeeded(&self) -> bool {
        self.build_ok == Some(true) && self.flash_ok == Some(true) && self.verify_ok != Some(false)
    }

    /// Whether this device makes the batch exit nonzero
    pub fn is_failure(&self) -> bool {
        match self.skip_reason {
            Some(reason) => !reason.is_intentional(),
            None => !self.succeeded(),
        }
    }

    /// One-word state for the summary
    pub fn state(&self) -> &'static str {
        if let Some(reason) = self.skip_reason {
            return reason.label();
        }
        match (self.build_ok, self.flash_ok, self.verify_ok) {
            (Some(false), _, _) => "build failed",
            (_, Some(false), _) => "flash failed",
            (_, Some(true), Some(false)) => "verify failed",
            (Some(true), Some(true), _) => "success",
            _ => "not attempted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flash_method_parse() {
        assert_eq!("katapult".parse::<FlashMethod>(), Ok(FlashMethod::Katapult));
        assert_eq!(" Make_Flash ".parse::<FlashMethod>(), Ok(FlashMethod::MakeFlash));
        assert!("dfu".parse::<FlashMethod>().is_err());
        assert_eq!(FlashMethod::Katapult.other(), FlashMethod::MakeFlash);
    }

    #[test]
    fn test_bootloader_tristate() {
        let r = BootloaderCheckResult {
            status: BootloaderStatus::Inconclusive {
                message: "gone".into(),
            },
            note: None,
            elapsed: Duration::ZERO,
        };
        assert_eq!(r.has_bootloader(), None);
        assert_eq!(r.error_message(), Some("gone"));
    }

    #[test]
    fn test_intentional_skips_are_not_failures() {
        let mut excluded = BatchDeviceResult::new("a", "A");
        excluded.skip(SkipReason::Excluded, "excluded");
        assert!(!excluded.is_failure());

        let mut missing = BatchDeviceResult::new("b", "B");
        missing.skip(SkipReason::MissingConfig, "missing configuration");
        assert!(missing.is_failure());
        assert_eq!(missing.state(), "missing configuration");
    }

    #[test]
    fn test_state_labels() {
        let mut r = BatchDeviceResult::new("a", "A");
        r.build_ok = Some(true);
        r.flash_ok = Some(true);
        r.verify_ok = Some(true);
        assert_eq!(r.state(), "success");
        assert!(!r.is_failure());

        r.verify_ok = Some(false);
        assert_eq!(r.state(), "verify failed");
        assert!(r.is_failure());
    }
}
