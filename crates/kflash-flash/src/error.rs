//! Error types for flash flows

use std::path::PathBuf;

use kflash_core::error::ServiceError;
use thiserror::Error;

/// Errors that end a flash flow, or one device's part in a batch
#[derive(Debug, Error)]
pub enum FlashError {
    /// Registry, config cache or process error
    #[error(transparent)]
    Core(#[from] kflash_core::Error),

    /// The firmware service could not be stopped
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// Toolchain or recovery tool missing
    #[error("Environment check failed: {}", .0.join("; "))]
    Preflight(Vec<String>),

    /// A print is running or paused
    #[error("Print in progress: {filename} ({percent}%)")]
    PrinterBusy {
        /// File being printed
        filename: String,
        /// Progress percentage
        percent: u32,
    },

    /// Print status unavailable and the user declined to continue
    #[error("Print status unavailable and flashing was not confirmed")]
    SafetyDeclined,

    /// The device path vanished before flashing
    #[error("Device disconnected: {} no longer exists", .0.display())]
    DeviceGone(PathBuf),

    /// Device is marked non-flashable
    #[error("Device '{0}' is excluded from flashing")]
    Excluded(String),

    /// Device matches a blocked pattern
    #[error("Device '{key}' is blocked: {reason}")]
    Blocked {
        /// Registry key
        key: String,
        /// Block reason
        reason: String,
    },

    /// No live device matches the serial pattern
    #[error("Device '{0}' is not connected")]
    NotConnected(String),

    /// Several live devices match the serial pattern
    #[error("Serial pattern of '{key}' matches {count} connected devices")]
    Ambiguous {
        /// Registry key
        key: String,
        /// Number of matches
        count: usize,
    },

    /// No cached build configuration
    #[error("No cached configuration for '{0}'; run with --menuconfig to create one")]
    MissingConfig(String),

    /// Cached configuration targets another chip
    #[error("Chip mismatch for '{key}': registry expects {expected}, config targets {actual}")]
    ChipMismatch {
        /// Registry key
        key: String,
        /// Chip in the registry
        expected: String,
        /// Chip in the config
        actual: String,
    },

    /// USB descriptor names another chip and the user declined
    #[error("Connected device reports {actual}, registry expects {expected}; flash cancelled")]
    IdentityDeclined {
        /// Chip in the registry
        expected: String,
        /// Chip in the USB descriptor
        actual: String,
    },

    /// `make menuconfig` failed
    #[error("menuconfig failed: {0}")]
    Menuconfig(String),

    /// Firmware build failed
    #[error("Build failed: {0}")]
    Build(String),

    /// Both flash methods failed
    #[error("Flash failed: {0}")]
    Flash(String),

    /// Bootloader probe could not reach a verdict
    #[error("Bootloader check inconclusive: {0}")]
    Probe(String),

    /// Flashed device did not come back in runtime mode
    #[error("Verification failed: {0}")]
    Verify(String),

    /// User interrupt
    #[error("Interrupted")]
    Interrupted,
}

/// Result type for flash flows
pub type Result<T> = std::result::Result<T, FlashError>;
