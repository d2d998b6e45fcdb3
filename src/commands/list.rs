//! `list`: registered devices with their connection state

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use kflash_core::discovery::{self, SerialDevice};
use kflash_core::registry::RegistrySnapshot;
use kflash_core::usb::UsbBus;

use super::CommandResult;

/// Print the registry against the live serial bus
pub fn run_list(snapshot: &RegistrySnapshot, usb: &dyn UsbBus) -> CommandResult {
    let devices = usb.scan();
    let lines = render(snapshot, &devices, |p| usb.canonical_path(p).ok());
    for line in lines {
        println!("{}", line);
    }
    Ok(0)
}

/// Connection state of one registry entry
fn state_of(
    snapshot: &RegistrySnapshot,
    key: &str,
    devices: &[SerialDevice],
    claimed: &mut HashMap<PathBuf, String>,
    canonical: &impl Fn(&Path) -> Option<PathBuf>,
) -> String {
    let Some(entry) = snapshot.get(key) else {
        return String::new();
    };
    if let Some(reason) = snapshot.pattern_is_blocked(&entry.serial_pattern) {
        return format!("blocked ({})", reason);
    }
    let found = discovery::match_devices(&entry.serial_pattern, devices);
    let state = match found.as_slice() {
        [] => "disconnected".to_string(),
        [device] => {
            let path = canonical(&device.path).unwrap_or_else(|| device.path.clone());
            if let Some(owner) = claimed.get(&path) {
                format!("duplicate of {}", owner)
            } else if let Some(reason) = snapshot.blocked_reason(&device.filename) {
                format!("blocked ({})", reason)
            } else {
                claimed.insert(path, key.to_string());
                let mode = if discovery::is_bootloader(&device.filename) {
                    " [katapult]"
                } else {
                    ""
                };
                format!("connected{}", mode)
            }
        }
        many => format!("ambiguous ({} matches)", many.len()),
    };
    if entry.flashable {
        state
    } else {
        format!("{}, excluded", state)
    }
}

fn render(
    snapshot: &RegistrySnapshot,
    devices: &[SerialDevice],
    canonical: impl Fn(&Path) -> Option<PathBuf>,
) -> Vec<String> {
    let mut lines = Vec::new();
    let mut claimed = HashMap::new();

    if snapshot.devices.is_empty() {
        lines.push("No registered devices.".to_string());
    } else {
        let key_width = snapshot.devices.keys().map(|k| k.len()).max().unwrap_or(0);
        lines.push("Registered devices:".to_string());
        for (key, entry) in &snapshot.devices {
            let state = state_of(snapshot, key, devices, &mut claimed, &canonical);
            let flashed = entry
                .last_flashed
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "never".to_string());
            lines.push(format!(
                "  {:<kw$}  {:<20} {:<12} {:<28} last flashed: {}",
                key,
                entry.name,
                entry.mcu,
                state,
                flashed,
                kw = key_width
            ));
        }
    }

    let unregistered: Vec<&SerialDevice> = devices
        .iter()
        .filter(|d| discovery::is_supported(&d.filename))
        .filter(|d| {
            !snapshot
                .devices
                .values()
                .any(|e| discovery::matches(&e.serial_pattern, &d.filename))
        })
        .collect();
    if !unregistered.is_empty() {
        lines.push(String::new());
        lines.push("Unregistered devices:".to_string());
        for device in unregistered {
            let line = match snapshot.blocked_reason(&device.filename) {
                Some(reason) => format!("  {}  (blocked: {})", device.filename, reason),
                None => format!("  {}", device.filename),
            };
            lines.push(line);
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use kflash_core::registry::DeviceEntry;

    fn entry(name: &str, mcu: &str, pattern: &str, flashable: bool) -> DeviceEntry {
        DeviceEntry {
            name: name.into(),
            mcu: mcu.into(),
            serial_pattern: pattern.into(),
            flash_method: None,
            flashable,
            config_path: None,
            last_flashed: None,
        }
    }

    fn dev(name: &str) -> SerialDevice {
        SerialDevice::new(Path::new("/dev/serial/by-id"), name)
    }

    #[test]
    fn test_states() {
        let mut snapshot = RegistrySnapshot::default();
        snapshot.devices.insert(
            "a".into(),
            entry("Octopus", "stm32h723", "usb-Klipper_stm32h723xx_29001A*-if00", true),
        );
        snapshot.devices.insert(
            "b".into(),
            entry("Alias", "stm32h723", "usb-Klipper_stm32h723xx_29001A*-alias", true),
        );
        snapshot
            .devices
            .insert("c".into(), entry("EBB", "rp2040", "usb-Klipper_rp2040_*", false));
        let devices = vec![
            dev("usb-Klipper_stm32h723xx_29001A001151313531383332-if00"),
            dev("usb-Klipper_stm32h723xx_29001A001151313531383332-if00-alias"),
            dev("usb-katapult_stm32g0b1xx_4E0031000F50-if00"),
        ];

        let lines = render(&snapshot, &devices, |_| Some(PathBuf::from("/dev/ttyACM0")));
        assert!(lines[1].contains("connected") && lines[1].contains("never"));
        assert!(lines[2].contains("duplicate of a"));
        assert!(lines[3].contains("disconnected, excluded"));
        assert_eq!(lines[5], "Unregistered devices:");
        assert_eq!(lines[6], "  usb-katapult_stm32g0b1xx_4E0031000F50-if00");
    }

    #[test]
    fn test_empty_registry() {
        let lines = render(&RegistrySnapshot::default(), &[], |p| Some(p.to_path_buf()));
        assert_eq!(lines, vec!["No registered devices."]);
    }
}
