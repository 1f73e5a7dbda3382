//! Establish a connection with a target device
//!
//! The [Connection] struct abstracts over the serial connection and
//! sending/decoding of ROM bootloader commands, and provides higher-level
//! operations with the device. The flasher stub protocol is layered on top of
//! it by [crate::flasher::client::StubClient].

use std::{io::Write, time::Duration};

use log::{debug, info, warn};

use self::{
    command::{Command, CommandResponse, CommandType},
    reset::{BootloaderReset, FirmwareReset, ResetStrategy},
};
use crate::{
    error::{Error, ResultExt},
    flasher::stubs::FlashStub,
    interface::{Port, SerialInterface},
    slip,
    targets::{
        esp8266::{
            FLASH_WRITE_SIZE, MAC_REGS, MAX_RAM_BLOCK_SIZE, RESET_VECTOR, SOFT_RESET_ADDR,
        },
        Esp8266, MacAddress,
    },
};

pub mod command;
pub mod reset;

const MAX_CONNECT_ATTEMPTS: usize = 4;
/// The ROM answers a single sync command this many times
const SYNC_RESPONSES: usize = 8;
/// Time a frame may take to be accepted by the port
const FRAME_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// An established connection with a target device
pub struct Connection {
    /// Port carrying protocol traffic
    serial: Port,
    /// Port whose control lines are wired to the chip, if not `serial`
    control: Option<Port>,
    inverted: bool,
    connected: bool,
    flash_timeout: Duration,
}

impl Connection {
    pub fn new(serial: Port) -> Self {
        Connection {
            serial,
            control: None,
            inverted: false,
            connected: false,
            flash_timeout: CommandType::FlashBegin.timeout(),
        }
    }

    /// Move protocol traffic to `data`, the current port keeps driving the
    /// control lines
    pub fn with_data_port(mut self, data: Port) -> Self {
        let control = std::mem::replace(&mut self.serial, data);
        self.control = Some(control);
        self
    }

    /// Timeout for the ROM flash begin and data commands
    pub fn with_flash_timeout(mut self, timeout: Duration) -> Self {
        self.flash_timeout = timeout;
        self
    }

    /// Whether the control line levels are currently inverted
    pub fn signals_inverted(&self) -> bool {
        self.inverted
    }

    pub fn set_signals_inverted(&mut self, inverted: bool) {
        self.inverted = inverted;
    }

    /// Whether the last [Connection::connect] succeeded
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn control_port(&mut self) -> &mut dyn SerialInterface {
        match self.control.as_mut() {
            Some(control) => &mut **control,
            None => &mut *self.serial,
        }
    }

    fn ensure_connected(&self) -> Result<(), Error> {
        if self.connected {
            Ok(())
        } else {
            Err(Error::InvalidArgument(
                "not connected to the ROM bootloader".into(),
            ))
        }
    }

    /// Reset the chip into its ROM bootloader and synchronize with it
    ///
    /// The signal polarity is flipped after every failed attempt, starting
    /// from the preset one, so reversed wiring is found on the second attempt.
    pub fn connect(&mut self) -> Result<(), Error> {
        self.connected = false;

        for attempt in 0..MAX_CONNECT_ATTEMPTS {
            debug!(
                "Connect attempt {} (signals inverted: {})",
                attempt + 1,
                self.inverted
            );

            let reset = BootloaderReset::new(self.inverted);
            reset.reset(self.control_port())?;

            match self.sync() {
                Ok(()) => {
                    info!(
                        "Connected to ROM bootloader (signals inverted: {})",
                        self.inverted
                    );
                    self.connected = true;
                    return Ok(());
                }
                Err(e) => debug!("Failed to sync, error {e}, retrying"),
            }

            self.inverted = !self.inverted;
        }

        Err(Error::Unreachable)
    }

    /// Try to sync with the device
    pub(crate) fn sync(&mut self) -> Result<(), Error> {
        self.with_timeout(CommandType::Sync.timeout(), |connection| {
            // The first burst lets the ROM detect the baud rate
            connection.command(Command::Sync).ok();

            connection.command(Command::Sync)?;
            for _ in 1..SYNC_RESPONSES {
                connection.read_response(CommandType::Sync)?;
            }

            Ok(())
        })
    }

    /// Release GPIO0 and pulse reset, starting the firmware in flash
    pub fn reboot_into_firmware(&mut self) -> Result<(), Error> {
        let reset = FirmwareReset::new(self.inverted);
        reset.reset(self.control_port())
    }

    /// Restart the chip by jumping to the ROM reset vector
    pub fn soft_reset(&mut self) -> Result<(), Error> {
        self.ensure_connected()?;
        debug!("Soft resetting");

        self.with_timeout(CommandType::MemEnd.timeout(), |connection| {
            connection.command(Command::MemBegin {
                size: 0,
                blocks: 0,
                block_size: 0,
                offset: SOFT_RESET_ADDR,
            })?;
            connection.command(Command::MemEnd {
                entry: RESET_VECTOR,
            })?;
            Ok(())
        })
    }

    /// Set baud rate for the serial port
    pub fn set_baud(&mut self, speed: u32) -> Result<(), Error> {
        debug!("Setting baud rate to {speed}");
        self.serial.set_baud_rate(speed)
    }

    /// Get the current baud rate of the serial port
    pub fn get_baud(&self) -> Result<u32, Error> {
        self.serial.baud_rate()
    }

    /// Run a closure with the read timeout temporarily set to `timeout`
    pub fn with_timeout<T, F>(&mut self, timeout: Duration, mut f: F) -> Result<T, Error>
    where
        F: FnMut(&mut Connection) -> Result<T, Error>,
    {
        let old_timeout = self.serial.timeout();
        self.serial.set_timeout(timeout)?;

        let result = f(self);

        self.serial.set_timeout(old_timeout)?;

        result
    }

    /// Write a command to the serial port
    pub fn write_command(&mut self, command: Command<'_>) -> Result<(), Error> {
        debug!("Writing command: {}", command.command_type());

        self.serial.clear_input()?;
        let mut frame = Vec::new();
        command.write(&mut frame)?;
        self.write_frame(&frame)
    }

    fn read_response(&mut self, ty: CommandType) -> Result<CommandResponse, Error> {
        let frame = self.read_frame().for_command(ty)?;
        CommandResponse::parse(ty, &frame)
    }

    /// Write a command and read the response
    pub fn command(&mut self, command: Command<'_>) -> Result<CommandResponse, Error> {
        let ty = command.command_type();
        self.write_command(command).for_command(ty)?;
        self.read_response(ty)
    }

    /// Read a register
    pub fn read_reg(&mut self, reg: u32) -> Result<u32, Error> {
        self.ensure_connected()?;

        self.with_timeout(CommandType::ReadReg.timeout(), |connection| {
            connection.command(Command::ReadReg { address: reg })
        })
        .map(|response| response.value)
    }

    /// Read the factory programmed MAC address
    pub fn read_mac(&mut self) -> Result<MacAddress, Error> {
        let mac0 = self.read_reg(MAC_REGS[0])?;
        let mac1 = self.read_reg(MAC_REGS[1])?;

        Esp8266::mac_address(mac0, mac1)
    }

    /// Write `data` to RAM at `addr`, then jump to `entry` unless it is zero
    pub fn write_mem(&mut self, addr: u32, data: &[u8], entry: u32) -> Result<(), Error> {
        self.ensure_connected()?;

        let blocks = data.len().div_ceil(MAX_RAM_BLOCK_SIZE);
        debug!(
            "Writing {} bytes to RAM at {addr:#010x} in {blocks} blocks",
            data.len()
        );

        self.with_timeout(CommandType::MemBegin.timeout(), |connection| {
            connection.command(Command::MemBegin {
                size: data.len() as u32,
                blocks: blocks as u32,
                block_size: MAX_RAM_BLOCK_SIZE as u32,
                offset: addr,
            })?;

            for (sequence, block) in data.chunks(MAX_RAM_BLOCK_SIZE).enumerate() {
                connection.command(Command::MemData {
                    data: block,
                    sequence: sequence as u32,
                })?;
            }

            connection.command(Command::MemEnd { entry })?;
            Ok(())
        })
    }

    /// Upload the flasher stub and start it
    ///
    /// The parameters are written, little endian, directly in front of the
    /// stub code.
    pub fn run_stub(&mut self, stub: &FlashStub, params: &[u32]) -> Result<(), Error> {
        if params.len() != stub.num_params() {
            return Err(Error::InvalidStub(format!(
                "expected {} parameters, got {}",
                stub.num_params(),
                params.len()
            )));
        }

        debug!("Running stub with params {params:?}");

        let (data_start, data) = stub.data();
        if !data.is_empty() {
            self.write_mem(data_start, data, 0)?;
        }

        let (params_start, code) = stub.code();
        let mut block = Vec::with_capacity(params.len() * 4 + code.len());
        for param in params {
            block.extend_from_slice(&param.to_le_bytes());
        }
        block.extend_from_slice(code);

        self.write_mem(params_start, &block, stub.entry())
    }

    /// Write flash through the ROM bootloader, without a stub
    ///
    /// This is slow, but works on any chip that answers the sync. With
    /// `erase_workaround` the erase size is shrunk to compensate for the ROM
    /// erasing too much, and any failure of the final FlashEnd is ignored,
    /// since the ROM then reports an error or stays silent.
    pub fn flash_write(
        &mut self,
        addr: u32,
        data: &[u8],
        erase_workaround: bool,
    ) -> Result<(), Error> {
        self.ensure_connected()?;

        let blocks = data.len().div_ceil(FLASH_WRITE_SIZE);
        let len = blocks * FLASH_WRITE_SIZE;
        let erase_size = if erase_workaround {
            Esp8266::erase_size(addr as usize, len)
        } else {
            len
        };

        info!(
            "Writing {} bytes at {addr:#x} through the ROM (erase size {erase_size:#x})",
            data.len()
        );

        let timeout = self.flash_timeout;
        self.with_timeout(timeout, |connection| {
            connection.command(Command::FlashBegin {
                size: erase_size as u32,
                blocks: blocks as u32,
                block_size: FLASH_WRITE_SIZE as u32,
                offset: addr,
            })?;

            for (sequence, block) in data.chunks(FLASH_WRITE_SIZE).enumerate() {
                connection.command(Command::FlashData {
                    data: block,
                    pad_to: FLASH_WRITE_SIZE,
                    pad_byte: 0xff,
                    sequence: sequence as u32,
                })?;
            }

            Ok(())
        })?;

        match self.command(Command::FlashEnd { reboot: false }) {
            Err(err) if erase_workaround => {
                warn!("Ignoring expected error at the end of the flash write: {err}");
                Ok(())
            }
            result => result.map(drop),
        }
    }

    /// Write a single SLIP frame
    pub(crate) fn write_frame(&mut self, data: &[u8]) -> Result<(), Error> {
        slip::send_timeout(self.serial.as_mut(), data, FRAME_WRITE_TIMEOUT)
    }

    /// Read a single SLIP frame
    pub(crate) fn read_frame(&mut self) -> Result<Vec<u8>, Error> {
        slip::recv(&mut self.serial)
    }

    /// Write bytes without any framing
    pub(crate) fn write_raw(&mut self, data: &[u8]) -> Result<(), Error> {
        self.serial.write_all(data)?;
        self.serial.flush()?;
        Ok(())
    }

    /// Give up the connection, returning the port driving the control lines
    /// and the data port, if one was given
    pub fn into_ports(self) -> (Port, Option<Port>) {
        match self.control {
            Some(control) => (control, Some(self.serial)),
            None => (self.serial, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        flasher::stubs::test_stub,
        testing::{Line, Mode, MockPort, SimulatedEsp8266},
    };

    fn connected(sim: &SimulatedEsp8266) -> Connection {
        let (port, _handle) = sim.port();
        let mut connection = Connection::new(Box::new(port));
        connection.connect().unwrap();
        connection
    }

    #[test]
    fn connects_on_first_attempt() {
        let sim = SimulatedEsp8266::new();
        let (port, handle) = sim.port();
        let mut connection = Connection::new(Box::new(port));

        connection.connect().unwrap();

        assert!(connection.is_connected());
        assert!(!connection.signals_inverted());
        assert_eq!(handle.control_log().len(), 6);
        assert_eq!(handle.write_timeout(), Some(FRAME_WRITE_TIMEOUT));
        assert_eq!(sim.state().mode, Mode::Rom);
    }

    #[test]
    fn inverted_wiring_connects_on_second_attempt() {
        let sim = SimulatedEsp8266::new();
        sim.state().inverted_wiring = true;
        let (port, handle) = sim.port();
        let mut connection = Connection::new(Box::new(port));

        connection.connect().unwrap();

        assert!(connection.signals_inverted());
        // Two full reset sequences
        assert_eq!(handle.control_log().len(), 12);
        assert_eq!(handle.control_log()[6..8], [(Line::Dtr, true), (Line::Rts, false)]);
    }

    #[test]
    fn preset_polarity_flips_on_second_attempt() {
        let sim = SimulatedEsp8266::new();
        let (port, handle) = sim.port();
        let mut connection = Connection::new(Box::new(port));
        connection.set_signals_inverted(true);

        connection.connect().unwrap();

        assert!(!connection.signals_inverted());
        assert_eq!(handle.control_log().len(), 12);
    }

    #[test]
    fn silent_device_is_unreachable() {
        let (port, handle) = MockPort::new();
        let mut connection = Connection::new(Box::new(port));

        assert!(matches!(connection.connect(), Err(Error::Unreachable)));
        assert!(!connection.is_connected());
        assert_eq!(handle.control_log().len(), 6 * MAX_CONNECT_ATTEMPTS);
    }

    #[test]
    fn control_lines_stay_on_control_port() {
        let sim = SimulatedEsp8266::new();
        let (control, control_handle) = sim.port();
        let (data, data_handle) = sim.port();
        let mut connection = Connection::new(Box::new(control)).with_data_port(Box::new(data));

        connection.connect().unwrap();

        assert_eq!(control_handle.control_log().len(), 6);
        assert!(control_handle.written().is_empty());
        assert!(data_handle.control_log().is_empty());
        assert!(!data_handle.written().is_empty());

        let (control, data) = connection.into_ports();
        assert!(data.is_some());
        assert_eq!(control.name().as_deref(), Some("mock"));
    }

    #[test]
    fn commands_require_connection() {
        let sim = SimulatedEsp8266::new();
        let (port, _handle) = sim.port();
        let mut connection = Connection::new(Box::new(port));

        assert!(matches!(
            connection.write_mem(0x4010_0000, &[0; 4], 0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            connection.read_reg(0x3ff0_0050),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn reads_mac() {
        let sim = SimulatedEsp8266::new();
        let mut connection = connected(&sim);

        assert_eq!(connection.read_mac().unwrap().to_string(), "18:fe:34:12:34:5a");
    }

    #[test]
    fn runs_stub_with_params() {
        let sim = SimulatedEsp8266::new();
        let mut connection = connected(&sim);

        connection.run_stub(&test_stub(), &[460_800]).unwrap();

        assert_eq!(sim.state().mode, Mode::Stub);
        assert_eq!(sim.state().stub_params, [460_800]);
        assert_eq!(connection.read_frame().unwrap(), b"OHAI");
    }

    #[test]
    fn stub_param_count_is_checked() {
        let sim = SimulatedEsp8266::new();
        let mut connection = connected(&sim);

        assert!(matches!(
            connection.run_stub(&test_stub(), &[]),
            Err(Error::InvalidStub(_))
        ));
    }

    #[test]
    fn rom_flash_write_with_erase_workaround() {
        let sim = SimulatedEsp8266::new();
        let mut connection = connected(&sim);
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();

        connection.flash_write(0x2000, &data, true).unwrap();

        let state = sim.state();
        assert_eq!(
            state.rom_erase_sizes,
            [Esp8266::erase_size(0x2000, 5 * FLASH_WRITE_SIZE) as u32]
        );
        assert_eq!(&state.flash[0x2000..0x2000 + data.len()], &data[..]);
        assert!(state.flash[0x2000 + data.len()..0x2000 + 5 * 1024]
            .iter()
            .all(|&b| b == 0xff));
    }

    #[test]
    fn silent_flash_end_is_ignored_with_workaround() {
        let sim = SimulatedEsp8266::new();
        sim.state().silent_flash_end = true;
        let mut connection = connected(&sim);

        connection.flash_write(0x4000, &[0x17; 2048], true).unwrap();
        assert_eq!(&sim.state().flash[0x4000..0x4800], &[0x17u8; 2048][..]);

        assert!(matches!(
            connection.flash_write(0x4000, &[0x17; 1024], false),
            Err(Error::Timeout(_))
        ));
    }

    #[test]
    fn rom_flash_write_without_workaround_reports_errors() {
        let sim = SimulatedEsp8266::new();
        let mut connection = connected(&sim);

        connection.flash_write(0x3000, &[0x42; 1024], false).unwrap();
        assert_eq!(sim.state().rom_erase_sizes, [1024]);
        assert_eq!(sim.state().flash[0x3000], 0x42);
    }

    #[test]
    fn soft_reset_jumps_to_reset_vector() {
        let sim = SimulatedEsp8266::new();
        let mut connection = connected(&sim);

        connection.soft_reset().unwrap();

        assert_eq!(sim.state().soft_resets, 1);
        assert_eq!(sim.state().mode, Mode::Firmware);
    }

    #[test]
    fn reboot_releases_boot_select() {
        let sim = SimulatedEsp8266::new();
        let (port, handle) = sim.port();
        let mut connection = Connection::new(Box::new(port));
        connection.connect().unwrap();

        connection.reboot_into_firmware().unwrap();

        assert_eq!(sim.state().mode, Mode::Firmware);
        assert_eq!(
            handle.control_log()[6..],
            [
                (Line::Dtr, false),
                (Line::Rts, true),
                (Line::Dtr, false),
                (Line::Rts, false),
            ]
        );
    }
}
