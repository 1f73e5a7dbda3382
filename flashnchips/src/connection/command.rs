//! Commands understood by the ESP8266 ROM bootloader

use std::{io::Write, mem::size_of, time::Duration};

use bytemuck::{bytes_of, Pod, Zeroable};
use strum::{Display, FromRepr, IntoStaticStr};

use crate::error::{Error, ProtocolError, RomError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const SYNC_TIMEOUT: Duration = Duration::from_millis(100);
const FLASH_TIMEOUT: Duration = Duration::from_secs(10);

/// Seed of the XOR checksum carried by data blocks
pub const CHECKSUM_INIT: u8 = 0xEF;

/// Input data for SYNC command (36 bytes: 0x07 0x07 0x12 0x20, followed by
/// 32 x 0x55)
const SYNC_FRAME: [u8; 36] = [
    0x07, 0x07, 0x12, 0x20, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55,
];

/// Direction byte of a request
const DIRECTION_REQUEST: u8 = 0x00;
/// Direction byte of a response
const DIRECTION_RESPONSE: u8 = 0x01;
/// Size of the response header preceding the body
const RESPONSE_HEADER_LEN: usize = 8;

/// Types of commands that can be sent to the ROM bootloader
#[derive(Copy, Clone, Debug, Display, FromRepr, IntoStaticStr, PartialEq, Eq)]
#[non_exhaustive]
#[repr(u8)]
pub enum CommandType {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    MemBegin = 0x05,
    MemEnd = 0x06,
    MemData = 0x07,
    Sync = 0x08,
    ReadReg = 0x0A,
}

impl CommandType {
    /// Return a timeout based on the command type
    pub fn timeout(&self) -> Duration {
        match self {
            CommandType::Sync => SYNC_TIMEOUT,
            CommandType::FlashBegin | CommandType::FlashData => FLASH_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }
}

/// Available commands
#[derive(Copy, Clone, Debug)]
#[non_exhaustive]
pub enum Command<'a> {
    FlashBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    FlashData {
        data: &'a [u8],
        pad_to: usize,
        pad_byte: u8,
        sequence: u32,
    },
    FlashEnd {
        reboot: bool,
    },
    MemBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    MemEnd {
        /// Address to jump to once the transfer completes, `0` to stay in the
        /// bootloader
        entry: u32,
    },
    MemData {
        data: &'a [u8],
        sequence: u32,
    },
    Sync,
    ReadReg {
        address: u32,
    },
}

impl Command<'_> {
    /// Return the command type
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::FlashBegin { .. } => CommandType::FlashBegin,
            Command::FlashData { .. } => CommandType::FlashData,
            Command::FlashEnd { .. } => CommandType::FlashEnd,
            Command::MemBegin { .. } => CommandType::MemBegin,
            Command::MemData { .. } => CommandType::MemData,
            Command::MemEnd { .. } => CommandType::MemEnd,
            Command::Sync => CommandType::Sync,
            Command::ReadReg { .. } => CommandType::ReadReg,
        }
    }

    /// Write a command
    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        // Write the Direction and Command Indentifier
        writer.write_all(&[DIRECTION_REQUEST, self.command_type() as u8])?;
        match *self {
            Command::FlashBegin {
                size,
                blocks,
                block_size,
                offset,
            }
            | Command::MemBegin {
                size,
                blocks,
                block_size,
                offset,
            } => {
                begin_command(writer, size, blocks, block_size, offset)?;
            }
            Command::FlashData {
                data,
                pad_to,
                pad_byte,
                sequence,
            } => {
                data_command(writer, data, pad_to, pad_byte, sequence)?;
            }
            Command::MemData { data, sequence } => {
                data_command(writer, data, 0, 0, sequence)?;
            }
            Command::FlashEnd { reboot } => {
                write_basic(writer, &u32::from(!reboot).to_le_bytes(), 0)?;
            }
            Command::MemEnd { entry } => {
                #[derive(Zeroable, Pod, Copy, Clone)]
                #[repr(C)]
                struct EntryParams {
                    no_entry: u32,
                    entry: u32,
                }
                let params = EntryParams {
                    no_entry: u32::from(entry == 0),
                    entry,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::Sync => {
                write_basic(writer, &SYNC_FRAME, 0)?;
            }
            Command::ReadReg { address } => {
                write_basic(writer, &address.to_le_bytes(), 0)?;
            }
        };
        Ok(())
    }
}

fn write_basic<W: Write>(mut writer: W, data: &[u8], checksum: u32) -> std::io::Result<()> {
    writer.write_all(&((data.len() as u16).to_le_bytes()))?;
    writer.write_all(&(checksum.to_le_bytes()))?;
    writer.write_all(data)?;
    Ok(())
}

fn begin_command<W: Write>(
    writer: W,
    size: u32,
    blocks: u32,
    block_size: u32,
    offset: u32,
) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone, Debug)]
    #[repr(C)]
    struct BeginParams {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    }

    let params = BeginParams {
        size,
        blocks,
        block_size,
        offset,
    };
    write_basic(writer, bytes_of(&params), 0)
}

fn data_command<W: Write>(
    mut writer: W,
    block_data: &[u8],
    pad_to: usize,
    pad_byte: u8,
    sequence: u32,
) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone, Debug)]
    #[repr(C)]
    struct BlockParams {
        size: u32,
        sequence: u32,
        dummy1: u32,
        dummy2: u32,
    }

    let pad_length = pad_to.saturating_sub(block_data.len());

    let params = BlockParams {
        size: (block_data.len() + pad_length) as u32,
        sequence,
        dummy1: 0,
        dummy2: 0,
    };

    let mut check = checksum(block_data, CHECKSUM_INIT);

    for _ in 0..pad_length {
        check = checksum(&[pad_byte], check);
    }

    let total_length = size_of::<BlockParams>() + block_data.len() + pad_length;
    writer.write_all(&((total_length as u16).to_le_bytes()))?;
    writer.write_all(&((check as u32).to_le_bytes()))?;
    writer.write_all(bytes_of(&params))?;
    writer.write_all(block_data)?;
    for _ in 0..pad_length {
        writer.write_all(&[pad_byte])?;
    }
    Ok(())
}

/// XOR-fold `data` into `checksum`
pub fn checksum(data: &[u8], mut checksum: u8) -> u8 {
    for byte in data {
        checksum ^= *byte;
    }

    checksum
}

/// A response from the ROM bootloader following a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub return_op: u8,
    pub value: u32,
    pub body: Vec<u8>,
}

impl CommandResponse {
    /// Parse and validate a response frame
    ///
    /// A two byte body is a `{status, lastError}` pair; a non-zero status is
    /// returned as a [RomError] for `command`.
    pub fn parse(command: CommandType, frame: &[u8]) -> Result<Self, Error> {
        if frame.len() < RESPONSE_HEADER_LEN {
            return Err(ProtocolError::ResponseTooShort(frame.len()).into());
        }
        if frame[0] != DIRECTION_RESPONSE {
            return Err(ProtocolError::InvalidDirection(frame[0]).into());
        }
        if frame[1] != command as u8 {
            return Err(ProtocolError::UnexpectedCommand {
                expected: command as u8,
                got: frame[1],
            }
            .into());
        }

        let body_len = u16::from_le_bytes([frame[2], frame[3]]) as usize;
        if frame.len() != RESPONSE_HEADER_LEN + body_len {
            return Err(ProtocolError::LengthMismatch {
                expected: body_len,
                got: frame.len() - RESPONSE_HEADER_LEN,
            }
            .into());
        }

        let value = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        let body = frame[RESPONSE_HEADER_LEN..].to_vec();

        if let [status, last_error] = body[..] {
            if status != 0 {
                return Err(RomError::new(command, status, last_error).into());
            }
        }

        Ok(CommandResponse {
            return_op: frame[1],
            value,
            body,
        })
    }
}
