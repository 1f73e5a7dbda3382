//! Serial port abstraction
//!
//! Everything above this module talks to a [SerialInterface]: a byte stream
//! with read timeouts, a configurable baud rate and the two modem control
//! lines used to reset the target.

use std::{
    io::{Read, Write},
    time::Duration,
};

use crate::error::Error;

/// A serial connection to a target device
pub trait SerialInterface: Read + Write + Send {
    /// Name of the underlying port, if it has one
    fn name(&self) -> Option<String>;

    /// Current read timeout
    fn timeout(&self) -> Duration;

    /// Set the read timeout; reads with no data available fail with
    /// [std::io::ErrorKind::TimedOut] after this long
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error>;

    /// Current baud rate
    fn baud_rate(&self) -> Result<u32, Error>;

    /// Change the baud rate
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), Error>;

    /// Set the level of the DTR line
    fn write_data_terminal_ready(&mut self, level: bool) -> Result<(), Error>;

    /// Set the level of the RTS line
    fn write_request_to_send(&mut self, level: bool) -> Result<(), Error>;

    /// Discard any buffered input
    fn clear_input(&mut self) -> Result<(), Error>;
}

/// An owned, type-erased serial connection
pub type Port = Box<dyn SerialInterface>;

#[cfg(feature = "serialport")]
pub use self::serial::Interface;

#[cfg(feature = "serialport")]
mod serial {
    use std::{
        io::{Read, Write},
        time::Duration,
    };

    use log::debug;
    use serialport::{ClearBuffer, FlowControl, SerialPort};

    use super::SerialInterface;
    use crate::error::Error;

    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

    /// [SerialInterface] backed by an operating system serial port
    pub struct Interface {
        serial_port: Box<dyn SerialPort>,
    }

    impl Interface {
        /// Open the named port at the given baud rate
        pub fn open(name: &str, baud: u32) -> Result<Self, Error> {
            debug!("Opening serial port {name} at {baud} baud");

            let serial_port = serialport::new(name, baud)
                .flow_control(FlowControl::None)
                .timeout(DEFAULT_TIMEOUT)
                .open()?;

            Ok(Self { serial_port })
        }

        /// Wrap an already opened port
        pub fn from_port(serial_port: Box<dyn SerialPort>) -> Self {
            Self { serial_port }
        }

        pub fn into_serial(self) -> Box<dyn SerialPort> {
            self.serial_port
        }
    }

    impl Read for Interface {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.serial_port.read(buf)
        }
    }

    impl Write for Interface {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.serial_port.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.serial_port.flush()
        }
    }

    impl SerialInterface for Interface {
        fn name(&self) -> Option<String> {
            self.serial_port.name()
        }

        fn timeout(&self) -> Duration {
            self.serial_port.timeout()
        }

        fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
            self.serial_port.set_timeout(timeout)?;
            Ok(())
        }

        fn baud_rate(&self) -> Result<u32, Error> {
            Ok(self.serial_port.baud_rate()?)
        }

        fn set_baud_rate(&mut self, baud: u32) -> Result<(), Error> {
            self.serial_port.set_baud_rate(baud)?;
            Ok(())
        }

        fn write_data_terminal_ready(&mut self, level: bool) -> Result<(), Error> {
            self.serial_port.write_data_terminal_ready(level)?;
            Ok(())
        }

        fn write_request_to_send(&mut self, level: bool) -> Result<(), Error> {
            self.serial_port.write_request_to_send(level)?;
            Ok(())
        }

        fn clear_input(&mut self) -> Result<(), Error> {
            self.serial_port.clear(ClearBuffer::Input)?;
            Ok(())
        }
    }
}
