//! USB serial device discovery and serial-pattern matching
//!
//! Boards running Klipper show up under `/dev/serial/by-id/` with names like
//! `usb-Klipper_stm32h723xx_29001A001151313531383332-if00`. After entering
//! the Katapult bootloader the same board shows up as
//! `usb-katapult_stm32h723xx_29001A001151313531383332-if00`. Registry serial
//! patterns are shell globs over these names, and matching treats the two
//! prefixes as interchangeable.

use std::fs;
use std::path::{Path, PathBuf};

use glob::Pattern;
use log::{debug, trace};
use once_cell::sync::Lazy;
use regex::Regex;

/// Default location of stable serial symlinks
pub const SERIAL_BY_ID: &str = "/dev/serial/by-id";

const KLIPPER_PREFIX: &str = "usb-Klipper_";
const KATAPULT_PREFIX: &str = "usb-katapult_";

static SERIAL_HEX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"usb-(?:Klipper|katapult)_[a-zA-Z0-9]+_([A-Fa-f0-9]+)").expect("valid regex")
});

static MCU_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)usb-(?:Klipper|katapult)_([a-z0-9]+?)(?:x[a-z0-9]*)?_").expect("valid regex")
});

/// One entry of the serial-by-id directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialDevice {
    /// Full path of the symlink
    pub path: PathBuf,
    /// File name, i.e. the USB descriptor string
    pub filename: String,
}

impl SerialDevice {
    /// Build from a directory and file name
    pub fn new(dir: &Path, filename: impl Into<String>) -> Self {
        let filename = filename.into();
        Self {
            path: dir.join(&filename),
            filename,
        }
    }
}

/// List `dir`, sorted by name; a missing directory is an empty bus
pub fn scan(dir: &Path) -> Vec<SerialDevice> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            trace!("Cannot read {}: {}", dir.display(), e);
            return Vec::new();
        }
    };
    let mut devices: Vec<SerialDevice> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .map(|name| SerialDevice::new(dir, name))
        .collect();
    devices.sort_by(|a, b| a.filename.cmp(&b.filename));
    devices
}

/// The pattern plus its Klipper/katapult counterpart
pub fn prefix_variants(pattern: &str) -> Vec<String> {
    let mut variants = vec![pattern.to_string()];
    if let Some(rest) = pattern.strip_prefix(KLIPPER_PREFIX) {
        variants.push(format!("{}{}", KATAPULT_PREFIX, rest));
    } else if let Some(rest) = pattern.strip_prefix(KATAPULT_PREFIX) {
        variants.push(format!("{}{}", KLIPPER_PREFIX, rest));
    }
    variants
}

/// Shell-glob match of one pattern, without prefix variants
pub fn glob_matches(pattern: &str, filename: &str) -> bool {
    match Pattern::new(pattern) {
        Ok(p) => p.matches(filename),
        Err(e) => {
            debug!("Invalid serial pattern '{}': {}", pattern, e);
            false
        }
    }
}

/// Prefix-agnostic match of a registry serial pattern
pub fn matches(pattern: &str, filename: &str) -> bool {
    prefix_variants(pattern)
        .iter()
        .any(|variant| glob_matches(variant, filename))
}

/// First device matching `pattern`
pub fn match_device<'a>(pattern: &str, devices: &'a [SerialDevice]) -> Option<&'a SerialDevice> {
    devices.iter().find(|d| matches(pattern, &d.filename))
}

/// Every device matching `pattern`; more than one means the pattern is ambiguous
pub fn match_devices<'a>(pattern: &str, devices: &'a [SerialDevice]) -> Vec<&'a SerialDevice> {
    devices.iter().filter(|d| matches(pattern, &d.filename)).collect()
}

/// Hex serial number embedded in a Klipper or katapult descriptor
pub fn extract_serial_hex(filename: &str) -> Option<String> {
    SERIAL_HEX_RE
        .captures(filename)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Chip family claimed by a descriptor, e.g. `stm32h723` for
/// `usb-Klipper_stm32h723xx_...`
pub fn extract_mcu(filename: &str) -> Option<String> {
    MCU_RE
        .captures(filename)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
}

/// Klipper or katapult descriptor
pub fn is_supported(filename: &str) -> bool {
    is_runtime(filename) || is_bootloader(filename)
}

/// Descriptor of a board running Klipper
pub fn is_runtime(filename: &str) -> bool {
    filename.to_ascii_lowercase().starts_with("usb-klipper_")
}

/// Descriptor of a board sitting in the Katapult bootloader
pub fn is_bootloader(filename: &str) -> bool {
    filename.to_ascii_lowercase().starts_with("usb-katapult_")
}

/// Glob matching the bootloader descriptor of the board with this serial
pub fn bootloader_pattern(serial_hex: &str) -> String {
    format!("{}*_{}*", KATAPULT_PREFIX, serial_hex)
}
