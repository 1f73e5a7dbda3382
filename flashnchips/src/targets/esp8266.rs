//! ESP8266 specifics
//!
//! Register and memory addresses used by the ROM bootloader, decoding of the
//! MAC address and the flash chip ID, and the erase size compensating for
//! the ROM erasing more than it is asked to.

use std::fmt::{self, Display, Formatter};

use crate::error::Error;

/// Registers holding the factory programmed MAC address
pub(crate) const MAC_REGS: [u32; 2] = [0x3ff0_0050, 0x3ff0_0054];

/// Address of the ROM reset vector, jumping here restarts the chip
pub(crate) const RESET_VECTOR: u32 = 0x4000_0080;
/// RAM address used for the dummy write preceding a soft reset
pub(crate) const SOFT_RESET_ADDR: u32 = 0x4010_0000;

pub const FLASH_SECTOR_SIZE: usize = 0x1000;
pub(crate) const FLASH_SECTORS_PER_BLOCK: usize = 16;
/// Block size used by the ROM flash write commands
pub(crate) const FLASH_WRITE_SIZE: usize = 0x400;
/// Block size used by the ROM memory write commands
pub(crate) const MAX_RAM_BLOCK_SIZE: usize = 0x1000;

/// First byte of a bootable image
pub const IMAGE_MAGIC: u8 = 0xE9;
/// Size of the SDK system parameters area at the end of flash
pub const SYSTEM_PARAMS_SIZE: usize = 0x4000;
/// Flash size assumed when the chip ID does not say
pub const DEFAULT_FLASH_SIZE: usize = 512 * 1024;

/// ESP8266 Target
pub struct Esp8266;

impl Esp8266 {
    /// Decode the MAC address from the two MAC registers
    pub fn mac_address(mac0: u32, mac1: u32) -> Result<MacAddress, Error> {
        let oui: [u8; 3] = match (mac1 >> 16) & 0xff {
            0 => [0x18, 0xfe, 0x34],
            1 => [0xac, 0xd0, 0x74],
            other => return Err(Error::UnknownVendor(other as u8)),
        };

        Ok(MacAddress([
            oui[0],
            oui[1],
            oui[2],
            ((mac1 >> 8) & 0xff) as u8,
            (mac1 & 0xff) as u8,
            ((mac0 >> 24) & 0xff) as u8,
        ]))
    }

    /// Flash size in bytes as reported by the JEDEC ID, falling back to
    /// [DEFAULT_FLASH_SIZE] for unknown parts
    pub fn flash_size(chip_id: u32) -> usize {
        let manufacturer = (chip_id >> 24) & 0xff;
        let capacity = (chip_id >> 8) & 0xff;

        if manufacturer != 0 && (0x13..0x20).contains(&capacity) {
            1 << capacity
        } else {
            DEFAULT_FLASH_SIZE
        }
    }

    /// Erase size to request from the ROM so that the region is erased
    /// exactly once
    ///
    /// The ROM erases the head of the region up to the next 64 KiB block
    /// twice, so the requested size is shrunk to compensate.
    pub fn erase_size(offset: usize, size: usize) -> usize {
        let start_sector = offset / FLASH_SECTOR_SIZE;
        let head_sectors = FLASH_SECTORS_PER_BLOCK - start_sector % FLASH_SECTORS_PER_BLOCK;
        let sector_count = size.div_ceil(FLASH_SECTOR_SIZE);

        if sector_count <= 2 * head_sectors {
            (sector_count / 2 + sector_count % 2) * FLASH_SECTOR_SIZE
        } else {
            size - head_sectors * FLASH_SECTOR_SIZE
        }
    }
}

/// A six byte hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddress(pub [u8; 6]);

impl Display for MacAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}
