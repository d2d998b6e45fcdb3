//! kflash-linux-usb - Linux sysfs USB support
//!
//! Implements [`UsbBus`](kflash_core::usb::UsbBus) on top of
//! `/dev/serial/by-id` and `/sys/class/tty`.
//!
//! # Re-enumeration without unplugging
//!
//! Every USB device directory in sysfs has an `authorized` attribute.
//! Writing `0` detaches the kernel drivers and makes the device disappear;
//! writing `1` brings it back and it enumerates from scratch, exactly as if
//! the cable had been pulled. The path is found by walking from the serial
//! symlink to its tty, from the tty to its USB interface, and up one level
//! to the device:
//!
//! ```text
//! /dev/serial/by-id/usb-Klipper_rp2040_E661-if00 -> ../../ttyACM0
//! /sys/class/tty/ttyACM0/device                  -> .../usb1/1-1/1-1.3/1-1.3:1.0
//! /sys/bus/usb/devices/.../1-1.3/authorized
//! ```
//!
//! The attribute is root-owned, so writes go through `sudo tee`.

pub mod device;
pub mod error;

pub use device::SysfsUsbBus;
pub use error::{LinuxUsbError, Result};
