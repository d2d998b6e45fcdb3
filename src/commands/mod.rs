//! CLI command implementations
//!
//! Each command returns the process exit code. Errors bubble up to `main`,
//! which prints them and exits 1.

mod check;
mod devices;
mod flash;
mod list;

pub use check::run_check;
pub use devices::set_flashable;
pub use flash::{run_flash, run_flash_all};
pub use list::run_list;

/// Exit code or a fatal error
pub type CommandResult = Result<i32, Box<dyn std::error::Error>>;
