//! Control-line sequences for resetting the target
//!
//! On the usual ESP8266 boards DTR drives GPIO0 and RTS drives the reset
//! (EN) pin, both through inverting transistors. Some adapters are wired the
//! other way around, which every strategy here can compensate for by
//! inverting the levels it writes.

use std::{thread::sleep, time::Duration};

use log::debug;

use crate::{error::Error, interface::SerialInterface};

/// Some strategy for resetting a target device
pub trait ResetStrategy {
    fn reset(&self, interface: &mut dyn SerialInterface) -> Result<(), Error>;

    /// Whether the levels written to the control lines are inverted
    fn inverted(&self) -> bool;

    fn set_dtr(&self, interface: &mut dyn SerialInterface, level: bool) -> Result<(), Error> {
        interface.write_data_terminal_ready(level ^ self.inverted())
    }

    fn set_rts(&self, interface: &mut dyn SerialInterface, level: bool) -> Result<(), Error> {
        interface.write_request_to_send(level ^ self.inverted())
    }
}

/// Reset the chip with GPIO0 held low so that it starts its ROM bootloader
#[derive(Debug, Clone, Copy)]
pub struct BootloaderReset {
    inverted: bool,
}

impl BootloaderReset {
    pub fn new(inverted: bool) -> Self {
        Self { inverted }
    }
}

impl ResetStrategy for BootloaderReset {
    fn reset(&self, interface: &mut dyn SerialInterface) -> Result<(), Error> {
        debug!(
            "Resetting into bootloader (signals inverted: {})",
            self.inverted
        );

        self.set_dtr(interface, false)?; // IO0 = HIGH
        self.set_rts(interface, true)?; // EN = LOW, chip in reset

        sleep(Duration::from_millis(10));

        self.set_dtr(interface, true)?; // IO0 = LOW
        self.set_rts(interface, false)?; // EN = HIGH, chip out of reset

        sleep(Duration::from_millis(50));

        self.set_dtr(interface, false)?; // IO0 = HIGH, done
        self.set_rts(interface, false)?;

        Ok(())
    }

    fn inverted(&self) -> bool {
        self.inverted
    }
}

/// Reset the chip with GPIO0 released so that it boots the firmware in flash
#[derive(Debug, Clone, Copy)]
pub struct FirmwareReset {
    inverted: bool,
}

impl FirmwareReset {
    pub fn new(inverted: bool) -> Self {
        Self { inverted }
    }
}

impl ResetStrategy for FirmwareReset {
    fn reset(&self, interface: &mut dyn SerialInterface) -> Result<(), Error> {
        debug!(
            "Resetting into firmware (signals inverted: {})",
            self.inverted
        );

        self.set_dtr(interface, false)?; // IO0 = HIGH
        self.set_rts(interface, true)?; // EN = LOW, chip in reset

        sleep(Duration::from_millis(50));

        self.set_dtr(interface, false)?;
        self.set_rts(interface, false)?; // EN = HIGH, chip out of reset

        Ok(())
    }

    fn inverted(&self) -> bool {
        self.inverted
    }
}
