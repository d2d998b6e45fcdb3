//! TOML registry file
//!
//! ```toml
//! [global]
//! klipper_dir = "~/klipper"
//! katapult_dir = "~/katapult"
//! default_flash_method = "katapult"
//! allow_flash_fallback = true
//! stagger_delay = 2.0
//!
//! [devices.octopus]
//! name = "Octopus Pro"
//! mcu = "stm32h723"
//! serial_pattern = "usb-Klipper_stm32h723xx_29001A00*"
//!
//! [devices.ebb]
//! name = "EBB36"
//! mcu = "stm32g0b1"
//! serial_pattern = "usb-Klipper_stm32g0b1xx_4E0031*"
//! flash_method = "make_flash"
//! flashable = false
//!
//! [[blocked_devices]]
//! pattern = "usb-Cartographer_*"
//! reason = "probe, not an MCU"
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use log::debug;
use tempfile::NamedTempFile;

use super::RegistrySnapshot;
use crate::error::{Error, Result};

/// Parse a registry from TOML text
pub fn from_str(text: &str, origin: &Path) -> Result<RegistrySnapshot> {
    ::toml::from_str(text).map_err(|source| Error::RegistryParse {
        path: origin.to_path_buf(),
        source,
    })
}

/// Read a registry file; a missing file yields the default registry
pub fn load(path: &Path) -> Result<RegistrySnapshot> {
    match fs::read_to_string(path) {
        Ok(text) => {
            debug!("Loaded registry from {}", path.display());
            from_str(&text, path)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("No registry at {}, using defaults", path.display());
            Ok(RegistrySnapshot::default())
        }
        Err(e) => Err(Error::io(path, e)),
    }
}

/// Write a registry file atomically: temp file in the same directory,
/// fsync, rename over the target
pub fn save(path: &Path, snapshot: &RegistrySnapshot) -> Result<()> {
    let text = ::toml::to_string_pretty(snapshot)?;
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| Error::io(dir, e))?;
    tmp.write_all(text.as_bytes())
        .map_err(|e| Error::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| Error::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| Error::io(path, e.error))?;
    debug!("Saved registry to {}", path.display());
    Ok(())
}
