//! Flash firmware onto ESP8266 devices
//!
//! `flashnchips` talks to the ROM bootloader of the chip over a serial port,
//! uploads a small flasher stub and uses it to write a firmware directory to
//! flash. Along the way it keeps the files already stored on the device's
//! filesystem, gives every device an ID, and only writes the sectors that
//! change.
//!
//! ## As an application
//!
//! Install with the default `cli` feature and run `flashnchips --help`.
//!
//! ## As a library
//!
//! ```toml
//! flashnchips = { version = "0.1", default-features = false, features = ["serialport"] }
//! ```
//!
//! Build a [Flasher], give it a port and a firmware, and either
//! [run](Flasher::run) it or [spawn](Flasher::spawn) it on a worker thread.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub use self::{
    error::Error,
    flasher::{Flasher, FlasherConfig},
    image::FirmwareImage,
    targets::Chip,
};

#[cfg(feature = "cli")]
pub mod cli;
pub mod connection;
pub mod error;
pub mod flasher;
pub mod fs;
pub mod image;
pub mod interface;
#[cfg(feature = "cli")]
pub mod logging;
pub mod progress;
pub mod slip;
pub mod targets;

#[cfg(test)]
mod testing;
