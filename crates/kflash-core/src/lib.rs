//! kflash-core - Core library for Klipper firmware flashing
//!
//! This crate holds everything the flashing engine needs that is not itself
//! an engine stage:
//!
//! - The result types shared by every stage ([`models`])
//! - The device registry snapshot and its TOML persistence ([`registry`])
//! - USB serial discovery and serial-pattern matching ([`discovery`])
//! - The cached build configuration store ([`kconfig`])
//! - Firmware version comparison ([`versions`])
//! - Host seams: subprocess execution ([`process`]), the USB bus
//!   ([`usb`]), the firmware service ([`service`]), the print-status
//!   source ([`status`]) and user-facing output ([`console`])
//!
//! The host seams are traits so the engine can be driven against real
//! hardware (`kflash-linux-usb`, [`process::SystemRunner`],
//! [`service::SystemdService`]) or against the in-memory doubles in
//! `kflash-dummy`.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod console;
pub mod discovery;
pub mod error;
pub mod kconfig;
pub mod models;
pub mod paths;
pub mod process;
pub mod registry;
pub mod service;
pub mod status;
pub mod usb;
pub mod versions;

pub use error::{Error, Result};
