//! `exclude` and `include`

use kflash_core::registry::Registry;

use super::CommandResult;

/// Toggle whether `key` takes part in flash runs and save the registry
pub fn set_flashable(registry: &Registry, key: &str, flashable: bool) -> CommandResult {
    let mut snapshot = registry.load()?;
    snapshot.set_flashable(key, flashable)?;
    registry.save(&snapshot)?;

    let name = snapshot
        .get(key)
        .map(|e| e.name.as_str())
        .unwrap_or(key);
    if flashable {
        println!("{} ({}) will be flashed by flash-all", name, key);
    } else {
        println!("{} ({}) excluded from flash runs", name, key);
    }
    Ok(0)
}
