//! kflash - Build and flash Klipper firmware onto USB-attached MCU boards
//!
//! Devices are registered in a TOML file (see `kflash_core::registry`) that
//! names each board's MCU, its `/dev/serial/by-id` pattern and an optional
//! flash method. The commands are thin wrappers around the flows in
//! `kflash-flash`:
//!
//! - `flash` builds and flashes one device
//! - `flash-all` validates, builds and flashes every flashable device
//! - `check` probes whether a device has a Katapult bootloader
//! - `list`, `exclude` and `include` inspect and edit the registry

mod cli;
mod commands;
mod moonraker;
mod output;

use clap::Parser;
use cli::{Cli, Commands};
use kflash_core::process::SystemRunner;
use kflash_core::registry::{default_registry_path, Registry};
use kflash_core::service::SystemdService;
use kflash_flash::{interrupt, Host, SingleFlashOptions};
use kflash_linux_usb::SysfsUsbBus;
use moonraker::MoonrakerClient;
use output::TerminalConsole;

use commands::CommandResult;

/// Exit code after Ctrl+C, as a shell would report SIGINT
const EXIT_INTERRUPTED: i32 = 130;

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = interrupt::install_handler() {
        log::warn!("Cannot install Ctrl+C handler: {}", e);
    }

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    };
    let code = if interrupt::interrupted() {
        EXIT_INTERRUPTED
    } else {
        code
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> CommandResult {
    let registry = Registry::new(cli.registry.clone().unwrap_or_else(default_registry_path));
    log::debug!("Using registry {}", registry.path().display());

    match &cli.command {
        Commands::Exclude { device } => return commands::set_flashable(&registry, device, false),
        Commands::Include { device } => return commands::set_flashable(&registry, device, true),
        _ => {}
    }

    let snapshot = registry.load()?;
    log::info!("Loaded {} registered devices", snapshot.devices.len());

    let runner = SystemRunner::new().with_cancel(interrupt::flag());
    let usb = SysfsUsbBus::new(&runner);
    if let Commands::List = cli.command {
        return commands::run_list(&snapshot, &usb);
    }

    let service = SystemdService::new(snapshot.global.service_name.clone(), &runner);
    let status = MoonrakerClient::new(&cli.moonraker_url);
    let console = TerminalConsole::new();
    let host = Host {
        runner: &runner,
        usb: &usb,
        service: &service,
        status: &status,
        console: &console,
    };

    match cli.command {
        Commands::Flash {
            device,
            menuconfig,
            probe_first,
        } => {
            let options = SingleFlashOptions {
                menuconfig,
                probe_first,
            };
            commands::run_flash(host, &registry, snapshot, &device, options)
        }
        Commands::FlashAll => commands::run_flash_all(host, &registry, snapshot),
        Commands::Check { device } => commands::run_check(host, &snapshot, &device),
        Commands::List | Commands::Exclude { .. } | Commands::Include { .. } => Ok(0),
    }
}
