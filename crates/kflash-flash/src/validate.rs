//! Per-device checks shared by the batch and single-device flows

use kflash_core::discovery::{self, SerialDevice};
use kflash_core::kconfig::{self, ConfigCache, KconfigFile};
use kflash_core::registry::{DeviceEntry, RegistrySnapshot};

use crate::error::{FlashError, Result};

/// Load the cached configuration of `key` and check it targets `entry.mcu`
pub(crate) fn checked_config(
    cache: &ConfigCache,
    key: &str,
    entry: &DeviceEntry,
) -> Result<KconfigFile> {
    let config = cache
        .load(key)?
        .ok_or_else(|| FlashError::MissingConfig(key.to_string()))?;
    let chip = kconfig::chip_of(&config)?;
    if !kconfig::chips_match(&entry.mcu, &chip) {
        return Err(FlashError::ChipMismatch {
            key: key.to_string(),
            expected: entry.mcu.clone(),
            actual: chip,
        });
    }
    Ok(config)
}

/// The single live device `entry` refers to
pub(crate) fn locate<'d>(
    snapshot: &RegistrySnapshot,
    key: &str,
    entry: &DeviceEntry,
    devices: &'d [SerialDevice],
) -> Result<&'d SerialDevice> {
    let found = discovery::match_devices(&entry.serial_pattern, devices);
    let device = match found.as_slice() {
        [] => return Err(FlashError::NotConnected(key.to_string())),
        [one] => *one,
        many => {
            return Err(FlashError::Ambiguous {
                key: key.to_string(),
                count: many.len(),
            })
        }
    };
    if let Some(reason) = snapshot.blocked_reason(&device.filename) {
        return Err(FlashError::Blocked {
            key: key.to_string(),
            reason,
        });
    }
    Ok(device)
}

/// Chip the USB descriptor claims, when it differs from the registry
///
/// Descriptors that cannot be parsed are not a mismatch.
pub(crate) fn identity_mismatch(entry: &DeviceEntry, device: &SerialDevice) -> Option<String> {
    discovery::extract_mcu(&device.filename).filter(|mcu| !kconfig::chips_match(mcu, &entry.mcu))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn entry(mcu: &str, pattern: &str) -> DeviceEntry {
        DeviceEntry {
            name: "Octopus".into(),
            mcu: mcu.into(),
            serial_pattern: pattern.into(),
            flash_method: None,
            flashable: true,
            config_path: None,
            last_flashed: None,
        }
    }

    fn dev(name: &str) -> SerialDevice {
        SerialDevice::new(Path::new("/dev/serial/by-id"), name)
    }

    #[test]
    fn test_checked_config() {
        let root = tempfile::tempdir().unwrap();
        let cache = ConfigCache::new(root.path());
        let e = entry("stm32h723", "usb-Klipper_stm32h723xx_*");

        assert!(matches!(
            checked_config(&cache, "octopus", &e),
            Err(FlashError::MissingConfig(_))
        ));

        fs::create_dir_all(root.path().join("octopus")).unwrap();
        fs::write(root.path().join("octopus/.config"), "CONFIG_LOW_LEVEL_OPTIONS=y\n").unwrap();
        assert!(matches!(
            checked_config(&cache, "octopus", &e),
            Err(FlashError::Core(kflash_core::Error::MissingMcu { .. }))
        ));

        fs::write(root.path().join("octopus/.config"), "CONFIG_MCU=\"stm32f446xx\"\n").unwrap();
        match checked_config(&cache, "octopus", &e) {
            Err(FlashError::ChipMismatch { expected, actual, .. }) => {
                assert_eq!(expected, "stm32h723");
                assert_eq!(actual, "stm32f446xx");
            }
            other => panic!("unexpected {other:?}"),
        }

        fs::write(root.path().join("octopus/.config"), "CONFIG_MCU=\"stm32h723xx\"\n").unwrap();
        assert!(checked_config(&cache, "octopus", &e).is_ok());
    }

    #[test]
    fn test_locate() {
        let snapshot = RegistrySnapshot::default();
        let e = entry("rp2040", "usb-Klipper_rp2040_*");
        let devices = vec![
            dev("usb-Klipper_rp2040_E66138935F253A2C-if00"),
            dev("usb-Klipper_stm32h723xx_29001A001151313531383332-if00"),
        ];
        let found = locate(&snapshot, "ebb", &e, &devices).unwrap();
        assert!(found.filename.contains("E661"));

        assert!(matches!(
            locate(&snapshot, "ebb", &e, &devices[1..]),
            Err(FlashError::NotConnected(_))
        ));

        let twins = vec![
            dev("usb-Klipper_rp2040_E66138935F253A2C-if00"),
            dev("usb-Klipper_rp2040_0102030405060708-if00"),
        ];
        assert!(matches!(
            locate(&snapshot, "ebb", &e, &twins),
            Err(FlashError::Ambiguous { count: 2, .. })
        ));
    }

    #[test]
    fn test_locate_blocked_descriptor() {
        let snapshot = RegistrySnapshot::default();
        let e = entry("rp2040", "usb-*");
        let devices = vec![dev("usb-beacon_0123456789ABCDEF-if00")];
        assert!(matches!(
            locate(&snapshot, "probe", &e, &devices),
            Err(FlashError::Blocked { .. })
        ));
    }

    #[test]
    fn test_identity_mismatch() {
        let e = entry("stm32h723", "usb-Klipper_*");
        assert_eq!(
            identity_mismatch(&e, &dev("usb-Klipper_stm32h723xx_29001A00-if00")),
            None
        );
        assert_eq!(
            identity_mismatch(&e, &dev("usb-Klipper_rp2040_E661-if00")),
            Some("rp2040".to_string())
        );
        assert_eq!(identity_mismatch(&e, &dev("usb-1a86_USB_Serial-if00")), None);
    }
}
