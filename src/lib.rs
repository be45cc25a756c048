//! A library for controlling Xtralien instruments over USB serial and TCP.
//!
//! Commands are composed token by token on a [`Device`] and dispatched with a
//! terminal call, which optionally decodes the reply into a [`Value`]:
//!
//! ```rust,no_run
//! use xtralien::{CommandBuilder as _, Device, Invocation};
//!
//! # fn wrapper() -> Result<(), Box<dyn std::error::Error>> {
//! let mut device = Device::network("192.168.0.17")?;
//! device.select("smu1").select("set").select("voltage").invoke(Invocation::new().arg(1.2));
//! let reading = device.select("smu1").select("measure").query("auto");
//! println!("{reading}");
//! # Ok(())
//! # }
//! ```
//!
//! Instruments can also be found with the [`discover`] module, and replies
//! decoded by hand with the [`format`] module.

#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]
#![deny(missing_debug_implementations)]

pub mod connection;
pub mod device;
pub mod discover;
pub mod error;
pub mod format;
mod turnstile;

pub use device::{CommandBuilder, Device, DeviceDuplicate, Invocation};
pub use format::{Format, Value};
