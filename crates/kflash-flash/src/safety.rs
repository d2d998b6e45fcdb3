//! Print-status gate shared by every flash entry point

use kflash_core::console::Console;
use kflash_core::status::PrintStatusSource;
use log::{info, warn};

use crate::error::{FlashError, Result};

/// Refuse to continue while a print is active or paused
///
/// An unreachable status service is not proof the printer is idle, so the
/// user has to confirm explicitly; the prompt defaults to no.
pub fn check_print_status(status: &dyn PrintStatusSource, console: &dyn Console) -> Result<()> {
    console.phase("Safety", "Checking print status...");
    match status.get_status() {
        Some(current) if current.state.is_busy() => {
            let filename = current
                .filename
                .unwrap_or_else(|| "unknown file".to_string());
            let percent = (current.progress.clamp(0.0, 1.0) * 100.0).round() as u32;
            warn!("Refusing to flash: {} is {} ({}%)", filename, current.state, percent);
            Err(FlashError::PrinterBusy { filename, percent })
        }
        Some(current) => {
            info!("Printer state: {}", current.state);
            console.phase("Safety", "Printer idle");
            Ok(())
        }
        None => {
            console.warn("Print status unavailable (Moonraker unreachable)");
            if console.confirm("Continue without print-status safety check?", false) {
                Ok(())
            } else {
                Err(FlashError::SafetyDeclined)
            }
        }
    }
}
