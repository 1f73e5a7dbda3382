//! Library and application errors

use std::{
    fmt::{Display, Formatter},
    io,
};

use miette::Diagnostic;
use thiserror::Error;

use crate::{connection::command::CommandType, flasher::client::StubCommandType};

/// All possible errors returned by flashnchips
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Operation was cancelled by the user")]
    #[diagnostic(code(flashnchips::cancelled))]
    Cancelled,

    #[error("Timeout while running {0}command")]
    #[diagnostic(
        code(flashnchips::timeout),
        help("Check the wiring and try hard-resetting the device")
    )]
    Timeout(TimedOutCommand),

    #[error("Protocol error while talking to the device")]
    #[diagnostic(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("MD5 digest mismatch: expected {expected}, received {received}")]
    #[diagnostic(
        code(flashnchips::data_loss),
        help("The data was corrupted in transit, check the cable and lower the baud rate")
    )]
    DataLoss { expected: String, received: String },

    #[error("Filesystem is full, can not write '{name}' ({size} bytes)")]
    #[diagnostic(
        code(flashnchips::fs::full),
        help("Remove files from the filesystem or increase its size")
    )]
    FilesystemFull { name: String, size: usize },

    #[error("Failed to mount filesystem image: {0}")]
    #[diagnostic(code(flashnchips::fs::mount))]
    Mount(String),

    #[error("Failed to talk to the bootloader")]
    #[diagnostic(
        code(flashnchips::unreachable),
        help("Ensure that the device is connected and that DTR/RTS are wired to GPIO0/RESET, or put the device into flashing mode manually")
    )]
    Unreachable,

    #[error("Invalid argument: {0}")]
    #[diagnostic(code(flashnchips::invalid_argument))]
    InvalidArgument(String),

    #[error("Unknown MAC vendor byte: {0:#04x}")]
    #[diagnostic(code(flashnchips::unknown_vendor))]
    UnknownVendor(u8),

    #[error("Invalid flasher stub descriptor: {0}")]
    #[diagnostic(
        code(flashnchips::invalid_stub),
        help("Make sure the stub file was generated for the ESP8266 flasher")
    )]
    InvalidStub(String),

    #[error("No firmware loaded")]
    #[diagnostic(code(flashnchips::no_firmware))]
    NoFirmware,

    #[error("No serial port configured")]
    #[diagnostic(code(flashnchips::no_port))]
    NoPort,

    #[error("Failed to flash image at {addr:#x} ({size} bytes)")]
    #[diagnostic(code(flashnchips::flash_image))]
    FlashImage {
        addr: u32,
        size: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("Verification of image at {addr:#x} failed")]
    #[diagnostic(code(flashnchips::verify_failed))]
    VerifyFailed {
        addr: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("Flashing succeeded but reboot failed")]
    #[diagnostic(
        code(flashnchips::reboot_failed),
        help("You may need to reboot the device manually")
    )]
    RebootFailed(#[source] Box<Error>),

    #[error("Failed to open file: {0}")]
    #[diagnostic(code(flashnchips::file_open))]
    FileOpenError(String, #[source] io::Error),

    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(flashnchips::io))]
    Io(#[source] io::Error),

    #[cfg(feature = "serialport")]
    #[error("Serial port error: {0}")]
    #[diagnostic(code(flashnchips::serial_error))]
    Serial(#[source] serialport::Error),

    #[cfg(feature = "cli")]
    #[error(transparent)]
    #[diagnostic(code(flashnchips::dialoguer_error))]
    DialoguerError(#[from] dialoguer::Error),

    #[error("Internal Error")]
    InternalError,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => Error::Timeout(TimedOutCommand::default()),
            _ => Error::Io(err),
        }
    }
}

#[cfg(feature = "serialport")]
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::Io(io::ErrorKind::TimedOut) => {
                Error::Timeout(TimedOutCommand::default())
            }
            _ => Error::Serial(err),
        }
    }
}

impl From<RomError> for Error {
    fn from(err: RomError) -> Self {
        Error::Protocol(ProtocolError::Rom(err))
    }
}

/// Malformed traffic or a non-zero status reported by the device
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("Invalid SLIP escape sequence: 0xdb {0:#04x}")]
    #[diagnostic(
        code(flashnchips::slip_framing),
        help("Try hard-resetting the device and try again")
    )]
    InvalidEscape(u8),

    #[error("Response too short: {0} bytes")]
    #[diagnostic(code(flashnchips::response_too_short))]
    ResponseTooShort(usize),

    #[error("Invalid response direction byte: {0:#04x}")]
    #[diagnostic(code(flashnchips::invalid_direction))]
    InvalidDirection(u8),

    #[error("Response length mismatch: header says {expected} bytes, got {got}")]
    #[diagnostic(code(flashnchips::length_mismatch))]
    LengthMismatch { expected: usize, got: usize },

    #[error("Response to the wrong command: expected {expected:#04x}, got {got:#04x}")]
    #[diagnostic(code(flashnchips::unexpected_command))]
    UnexpectedCommand { expected: u8, got: u8 },

    #[error("The bootloader returned an error")]
    #[diagnostic(transparent)]
    Rom(RomError),

    #[error("Invalid stub handshake response received: {0:02x?}")]
    #[diagnostic(code(flashnchips::invalid_stub_handshake))]
    InvalidGreeting(Vec<u8>),

    #[error("Unexpected frame of {got} bytes, expected {expected}")]
    #[diagnostic(code(flashnchips::unexpected_frame))]
    UnexpectedFrame { expected: usize, got: usize },

    #[error("Flasher stub returned error code {0:#04x}")]
    #[diagnostic(code(flashnchips::stub_status))]
    StubStatus(u8),

    #[error("Read more bytes than expected: wanted {expected}, got {got}")]
    #[diagnostic(code(flashnchips::read_more_than_expected))]
    ReadMoreThanExpected { expected: usize, got: usize },

    #[error("Flash chip ID read as zero")]
    #[diagnostic(
        code(flashnchips::flash_chip_id),
        help("The SPI flash did not respond, check the flash chip wiring")
    )]
    InvalidChipId,
}

/// An executed command which has timed out
#[derive(Clone, Debug, Default)]
pub struct TimedOutCommand {
    command: Option<&'static str>,
}

impl Display for TimedOutCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{} ", command),
            None => Ok(()),
        }
    }
}

impl From<CommandType> for TimedOutCommand {
    fn from(ct: CommandType) -> Self {
        TimedOutCommand {
            command: Some(ct.into()),
        }
    }
}

impl From<StubCommandType> for TimedOutCommand {
    fn from(ct: StubCommandType) -> Self {
        TimedOutCommand {
            command: Some(ct.into()),
        }
    }
}

/// Error codes reported by the ESP8266 ROM in the `lastError` byte
#[derive(Clone, Copy, Debug, Default, Diagnostic, Error, PartialEq, Eq, strum::FromRepr)]
#[non_exhaustive]
#[repr(u8)]
pub enum RomErrorKind {
    #[error("No error")]
    #[diagnostic(code(flashnchips::rom::none))]
    None = 0x00,

    #[error("Invalid message received")]
    #[diagnostic(code(flashnchips::rom::invalid_message))]
    InvalidMessage = 0x05,

    #[error("Bootloader failed to execute command")]
    #[diagnostic(code(flashnchips::rom::failed))]
    FailedToAct = 0x06,

    #[error("Received message has invalid CRC")]
    #[diagnostic(code(flashnchips::rom::crc))]
    InvalidCrc = 0x07,

    #[error("Bootloader failed to write to flash")]
    #[diagnostic(code(flashnchips::rom::flash_write))]
    FlashWriteError = 0x08,

    #[error("Bootloader failed to read from flash")]
    #[diagnostic(code(flashnchips::rom::flash_read))]
    FlashReadError = 0x09,

    #[error("Invalid length for flash read")]
    #[diagnostic(code(flashnchips::rom::flash_read_length))]
    FlashReadLengthError = 0x0a,

    #[default]
    #[error("Other")]
    #[diagnostic(code(flashnchips::rom::other))]
    Other = 0xff,
}

impl From<u8> for RomErrorKind {
    fn from(raw: u8) -> Self {
        Self::from_repr(raw).unwrap_or_default()
    }
}

/// A non-zero status returned by the ROM bootloader
#[derive(Clone, Copy, Debug, Diagnostic, Error)]
#[error("Error while running {command} command (status {status:#04x}, last error {last_error:#04x})")]
#[non_exhaustive]
pub struct RomError {
    pub command: CommandType,
    pub status: u8,
    pub last_error: u8,
    #[source]
    kind: RomErrorKind,
}

impl RomError {
    pub fn new(command: CommandType, status: u8, last_error: u8) -> RomError {
        RomError {
            command,
            status,
            last_error,
            kind: RomErrorKind::from(last_error),
        }
    }

    /// Decoded form of the `lastError` byte
    pub fn kind(&self) -> RomErrorKind {
        self.kind
    }
}

pub(crate) trait ResultExt {
    /// Mark the command from which this error originates
    fn for_command<C: Into<TimedOutCommand>>(self, command: C) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn for_command<C: Into<TimedOutCommand>>(self, command: C) -> Self {
        match self {
            Err(Error::Timeout(_)) => Err(Error::Timeout(command.into())),
            res => res,
        }
    }
}
