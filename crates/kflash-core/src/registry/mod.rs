//! Device registry
//!
//! The registry maps device keys to board definitions plus a handful of
//! global settings. The flashing engine only ever sees a
//! [`RegistrySnapshot`] taken at the start of a run; persistent changes
//! (such as recording when a device was last flashed) are applied to the
//! snapshot after the run and written back in one go.
//!
//! The on-disk format is TOML, see [`toml`](self::toml).

pub mod toml;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::discovery;
use crate::error::{Error, Result};
use crate::models::FlashMethod;
use crate::paths::{app_config_dir, expand_tilde};
use crate::service::DEFAULT_SERVICE;

/// Devices that are never flashed, whatever the registry says
const BUILTIN_BLOCKED: &[(&str, &str)] = &[("usb-beacon_*", "Beacon probe, not a Klipper MCU")];

/// Settings shared by every device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Klipper source tree
    pub klipper_dir: PathBuf,
    /// Katapult source tree, for `scripts/flashtool.py`
    pub katapult_dir: PathBuf,
    /// Method tried first when a device does not choose one
    pub default_flash_method: FlashMethod,
    /// Try the other method when the first one fails
    pub allow_flash_fallback: bool,
    /// Seconds to wait between devices in a batch
    pub stagger_delay: f64,
    /// Seconds to wait for a flashed device to come back
    pub return_delay: f64,
    /// Root of the cached build configurations
    pub config_cache_dir: PathBuf,
    /// Systemd unit that owns the serial ports
    pub service_name: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            klipper_dir: PathBuf::from("~/klipper"),
            katapult_dir: PathBuf::from("~/katapult"),
            default_flash_method: FlashMethod::Katapult,
            allow_flash_fallback: true,
            stagger_delay: 2.0,
            return_delay: 5.0,
            config_cache_dir: app_config_dir().join("configs"),
            service_name: DEFAULT_SERVICE.to_string(),
        }
    }
}

impl GlobalConfig {
    /// Klipper tree with `~` expanded
    pub fn klipper_path(&self) -> PathBuf {
        expand_tilde(&self.klipper_dir)
    }

    /// Katapult tree with `~` expanded
    pub fn katapult_path(&self) -> PathBuf {
        expand_tilde(&self.katapult_dir)
    }

    /// Config cache root with `~` expanded
    pub fn config_cache_path(&self) -> PathBuf {
        expand_tilde(&self.config_cache_dir)
    }

    /// Pause between batch devices
    pub fn stagger(&self) -> Duration {
        Duration::from_secs_f64(self.stagger_delay.max(0.0))
    }

    /// Budget for a flashed device to re-enumerate
    pub fn return_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.return_delay.max(0.0))
    }
}

fn default_true() -> bool {
    true
}

/// One registered board
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Display name
    pub name: String,
    /// Chip the board carries, e.g. `stm32h723`
    pub mcu: String,
    /// Shell glob over `/dev/serial/by-id` names
    pub serial_pattern: String,
    /// Method tried first for this board
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flash_method: Option<FlashMethod>,
    /// Included in flash runs
    #[serde(default = "default_true")]
    pub flashable: bool,
    /// Override of the cached build configuration location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,
    /// When the board was last flashed successfully
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_flashed: Option<DateTime<Utc>>,
}

/// A device pattern that must never be flashed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedDevice {
    /// Shell glob over `/dev/serial/by-id` names
    pub pattern: String,
    /// Why it is blocked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Point-in-time copy of the registry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySnapshot {
    /// Global settings
    pub global: GlobalConfig,
    /// Devices by key, iterated in key order
    pub devices: BTreeMap<String, DeviceEntry>,
    /// User-defined blocked patterns
    pub blocked_devices: Vec<BlockedDevice>,
}

impl RegistrySnapshot {
    /// Look up a device
    pub fn get(&self, key: &str) -> Option<&DeviceEntry> {
        self.devices.get(key)
    }

    /// Look up a device, failing on unknown keys
    pub fn require(&self, key: &str) -> Result<&DeviceEntry> {
        self.get(key)
            .ok_or_else(|| Error::UnknownDevice(key.to_string()))
    }

    /// Method tried first for `entry`
    pub fn flash_method_for(&self, entry: &DeviceEntry) -> FlashMethod {
        entry
            .flash_method
            .unwrap_or(self.global.default_flash_method)
    }

    /// Where the cached build configuration of `key` lives
    pub fn config_path(&self, key: &str) -> PathBuf {
        match self.get(key).and_then(|e| e.config_path.as_deref()) {
            Some(path) => expand_tilde(path),
            None => self.global.config_cache_path().join(key).join(".config"),
        }
    }

    /// Reason a USB descriptor is blocked, if it is
    pub fn blocked_reason(&self, filename: &str) -> Option<String> {
        let builtin = BUILTIN_BLOCKED
            .iter()
            .map(|(pattern, reason)| (*pattern, Some(*reason)));
        let user = self
            .blocked_devices
            .iter()
            .map(|b| (b.pattern.as_str(), b.reason.as_deref()));
        builtin
            .chain(user)
            .find(|(pattern, _)| discovery::glob_matches(pattern, filename))
            .map(|(pattern, reason)| {
                reason
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("matches blocked pattern {}", pattern))
            })
    }

    /// Whether the serial pattern itself targets blocked hardware
    pub fn pattern_is_blocked(&self, serial_pattern: &str) -> Option<String> {
        let probe = serial_pattern.trim_end_matches('*');
        self.blocked_reason(serial_pattern)
            .or_else(|| self.blocked_reason(probe))
    }

    /// Toggle whether a device takes part in flash runs
    pub fn set_flashable(&mut self, key: &str, flashable: bool) -> Result<()> {
        let entry = self
            .devices
            .get_mut(key)
            .ok_or_else(|| Error::UnknownDevice(key.to_string()))?;
        entry.flashable = flashable;
        Ok(())
    }

    /// Stamp `last_flashed` on each key; unknown keys are ignored
    pub fn record_flashes<'k>(&mut self, keys: impl IntoIterator<Item = &'k str>, when: DateTime<Utc>) {
        for key in keys {
            if let Some(entry) = self.devices.get_mut(key) {
                entry.last_flashed = Some(when);
            }
        }
    }
}

/// Registry file location under the user's config home
pub fn default_registry_path() -> PathBuf {
    app_config_dir().join("devices.toml")
}

/// Registry file bound to a path on disk
#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
}

impl Registry {
    /// Registry stored at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File backing this registry
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take a snapshot; a missing file is an empty registry
    pub fn load(&self) -> Result<RegistrySnapshot> {
        self::toml::load(&self.path)
    }

    /// Replace the file contents with `snapshot`
    pub fn save(&self, snapshot: &RegistrySnapshot) -> Result<()> {
        self::toml::save(&self.path, snapshot)
    }
}
