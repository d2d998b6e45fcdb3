//! Cached Klipper build configurations
//!
//! Each device keeps its own Kconfig `.config` in the cache. Before a build
//! the cached file is installed into the Klipper tree; after an interactive
//! `menuconfig` the tree's file is saved back to the cache.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use tempfile::NamedTempFile;

use crate::error::{Error, Result};
use crate::registry::RegistrySnapshot;

/// Configurations older than this get a review warning
pub const STALE_AFTER: Duration = Duration::from_secs(90 * 24 * 60 * 60);

static CONFIG_MCU_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?m)^CONFIG_MCU="([^"]+)""#).expect("valid regex"));

/// A parsed Kconfig file
#[derive(Debug, Clone)]
pub struct KconfigFile {
    path: PathBuf,
    text: String,
}

impl KconfigFile {
    /// Wrap already-read contents
    pub fn from_text(path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            text: text.into(),
        }
    }

    /// File this was read from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw `CONFIG_MCU` value, if present
    pub fn mcu(&self) -> Option<&str> {
        CONFIG_MCU_RE
            .captures(&self.text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
    }
}

/// Target chip of a configuration; a config without one is corrupt
pub fn chip_of(config: &KconfigFile) -> Result<String> {
    config
        .mcu()
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| Error::MissingMcu {
            path: config.path.clone(),
        })
}

/// Chip identifiers match when either is a prefix of the other, so
/// `stm32h723` matches `stm32h723xx`
pub fn chips_match(a: &str, b: &str) -> bool {
    let a = a.trim().to_ascii_lowercase();
    let b = b.trim().to_ascii_lowercase();
    !a.is_empty() && !b.is_empty() && (a.starts_with(&b) || b.starts_with(&a))
}

/// Whether a configuration of this age should be reviewed
pub fn is_stale(age: Duration) -> bool {
    age >= STALE_AFTER
}

/// "5 minutes ago", "1 day ago", "120 days ago (recommend review)"
pub fn format_age(age: Duration) -> String {
    let secs = age.as_secs();
    let (n, unit) = if secs < 3600 {
        (secs / 60, "minute")
    } else if secs < 86_400 {
        (secs / 3600, "hour")
    } else {
        (secs / 86_400, "day")
    };
    let plural = if n == 1 { "" } else { "s" };
    let mut text = format!("{} {}{} ago", n, unit, plural);
    if is_stale(age) {
        text.push_str(" (recommend review)");
    }
    text
}

/// Per-device store of Kconfig files
#[derive(Debug, Clone)]
pub struct ConfigCache {
    root: PathBuf,
    overrides: HashMap<String, PathBuf>,
}

impl ConfigCache {
    /// Cache rooted at `root`, one `<key>/.config` per device
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            overrides: HashMap::new(),
        }
    }

    /// Cache laid out as the registry describes, honouring per-device overrides
    pub fn from_registry(snapshot: &RegistrySnapshot) -> Self {
        let mut cache = Self::new(snapshot.global.config_cache_path());
        for key in snapshot.devices.keys() {
            let path = snapshot.config_path(key);
            if path != cache.default_path(key) {
                cache.overrides.insert(key.clone(), path);
            }
        }
        cache
    }

    fn default_path(&self, key: &str) -> PathBuf {
        self.root.join(key).join(".config")
    }

    /// Where `key`'s configuration lives
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.overrides
            .get(key)
            .cloned()
            .unwrap_or_else(|| self.default_path(key))
    }

    /// Cached configuration for `key`, or `None` if there is none
    pub fn load(&self, key: &str) -> Result<Option<KconfigFile>> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(KconfigFile::from_text(
                path,
                String::from_utf8_lossy(&bytes),
            ))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(path, e)),
        }
    }

    /// Time since the cached configuration was written
    pub fn age(&self, key: &str) -> Option<Duration> {
        let modified = fs::metadata(self.path_for(key)).ok()?.modified().ok()?;
        Some(
            SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO),
        )
    }

    /// Copy the cached configuration into `<klipper_dir>/.config`
    pub fn install(&self, key: &str, klipper_dir: &Path) -> Result<()> {
        let src = self.path_for(key);
        let dst = klipper_dir.join(".config");
        debug!("Installing {} -> {}", src.display(), dst.display());
        atomic_copy(&src, &dst)
    }

    /// Save `<klipper_dir>/.config` into the cache for `key`
    pub fn save_from(&self, key: &str, klipper_dir: &Path) -> Result<()> {
        let src = klipper_dir.join(".config");
        let dst = self.path_for(key);
        if let Some(dir) = dst.parent() {
            fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        }
        debug!("Caching {} -> {}", src.display(), dst.display());
        atomic_copy(&src, &dst)
    }
}

fn atomic_copy(src: &Path, dst: &Path) -> Result<()> {
    let data = fs::read(src).map_err(|e| Error::io(src, e))?;
    let dir = dst.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| Error::io(dir, e))?;
    tmp.write_all(&data).map_err(|e| Error::io(dst, e))?;
    tmp.as_file().sync_all().map_err(|e| Error::io(dst, e))?;
    tmp.persist(dst).map_err(|e| Error::io(dst, e.error))?;
    Ok(())
}
