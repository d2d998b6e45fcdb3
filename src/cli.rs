//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Default Moonraker endpoint on a Klipper host
pub const DEFAULT_MOONRAKER_URL: &str = "http://localhost:7125";

#[derive(Parser)]
#[command(name = "kflash")]
#[command(author, version, about = "Build and flash Klipper firmware", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Device registry file
    /// Defaults to $XDG_CONFIG_HOME/kalico-flash/devices.toml
    #[arg(long, global = true)]
    pub registry: Option<PathBuf>,

    /// Moonraker base URL used for the print-status check
    #[arg(long, global = true, default_value = DEFAULT_MOONRAKER_URL)]
    pub moonraker_url: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build and flash one registered device
    Flash {
        /// Registry key of the device
        #[arg(short, long)]
        device: String,

        /// Run menuconfig before building and cache the result
        #[arg(long)]
        menuconfig: bool,

        /// Check for the Katapult bootloader before flashing
        #[arg(long)]
        probe_first: bool,
    },

    /// Build and flash every flashable registered device
    FlashAll,

    /// Check whether a device has a Katapult bootloader
    Check {
        /// Registry key of the device
        #[arg(short, long)]
        device: String,
    },

    /// List registered and connected devices
    List,

    /// Exclude a device from flash runs
    Exclude {
        /// Registry key of the device
        device: String,
    },

    /// Include a previously excluded device in flash runs
    Include {
        /// Registry key of the device
        device: String,
    },
}
