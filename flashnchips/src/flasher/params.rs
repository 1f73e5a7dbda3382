//! Flash parameters stored in the header of the boot image
//!
//! Bytes 2 and 3 of the image at offset 0 tell the ROM how to talk to the
//! SPI flash: the high byte holds the mode, the low byte the size in the
//! upper nibble and the frequency in the lower one.

use std::{
    fmt::{self, Formatter},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, VariantNames};

use crate::error::Error;

/// Supported flash modes
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Display, EnumIter, EnumString, VariantNames,
)]
#[non_exhaustive]
#[repr(u8)]
#[strum(serialize_all = "lowercase")]
pub enum FlashMode {
    /// Quad I/O (4 pins used for address & data)
    Qio = 0,
    /// Quad Output (4 pins used for data)
    Qout = 1,
    /// Dual I/O (2 pins used for address & data)
    #[default]
    Dio = 2,
    /// Dual Output (2 pins used for data)
    Dout = 3,
}

/// Supported flash sizes, in megabits, with their memory map variants
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Display, EnumIter, EnumString, VariantNames,
)]
#[non_exhaustive]
#[repr(u8)]
pub enum FlashSize {
    /// 512 KB
    #[default]
    #[strum(serialize = "4m")]
    _4Mbit = 0,
    /// 256 KB
    #[strum(serialize = "2m")]
    _2Mbit = 1,
    /// 1 MB
    #[strum(serialize = "8m")]
    _8Mbit = 2,
    /// 2 MB, 512 KB + 512 KB map
    #[strum(serialize = "16m")]
    _16Mbit = 3,
    /// 4 MB, 512 KB + 512 KB map
    #[strum(serialize = "32m")]
    _32Mbit = 4,
    /// 2 MB, 1024 KB + 1024 KB map
    #[strum(serialize = "16m-c1")]
    _16MbitC1 = 5,
    /// 4 MB, 1024 KB + 1024 KB map
    #[strum(serialize = "32m-c1")]
    _32MbitC1 = 6,
    /// 4 MB, 2048 KB + 2048 KB map
    #[strum(serialize = "32m-c2")]
    _32MbitC2 = 7,
}

impl FlashSize {
    /// The plain size code for a flash of `bytes`, if there is one
    pub fn from_bytes(bytes: usize) -> Option<FlashSize> {
        match bytes {
            0x40000 => Some(FlashSize::_2Mbit),
            0x80000 => Some(FlashSize::_4Mbit),
            0x100000 => Some(FlashSize::_8Mbit),
            0x200000 => Some(FlashSize::_16Mbit),
            0x400000 => Some(FlashSize::_32Mbit),
            _ => None,
        }
    }
}

/// Supported flash frequencies
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Display, EnumIter, EnumString, VariantNames,
)]
#[non_exhaustive]
#[repr(u8)]
pub enum FlashFrequency {
    /// 40 MHz
    #[default]
    #[strum(serialize = "40m")]
    _40Mhz = 0x0,
    /// 26 MHz
    #[strum(serialize = "26m")]
    _26Mhz = 0x1,
    /// 20 MHz
    #[strum(serialize = "20m")]
    _20Mhz = 0x2,
    /// 80 MHz
    #[strum(serialize = "80m")]
    _80Mhz = 0xf,
}

/// Encoded flash parameters, as written to the image header
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ParamsRepr", into = "u16")]
pub struct FlashParams(u16);

impl FlashParams {
    pub fn new(mode: FlashMode, size: FlashSize, frequency: FlashFrequency) -> Self {
        FlashParams((mode as u16) << 8 | (size as u16) << 4 | frequency as u16)
    }

    /// Parameters for a flash chip of `flash_size` bytes
    ///
    /// Dual I/O at 40 MHz, with the size capped to the largest plain map.
    pub fn for_flash_size(flash_size: usize) -> Self {
        let size = FlashSize::from_bytes(flash_size.min(0x400000)).unwrap_or_default();
        FlashParams::new(FlashMode::Dio, size, FlashFrequency::_40Mhz)
    }

    pub fn value(&self) -> u16 {
        self.0
    }

    /// Write the parameters into a boot image header
    pub fn patch(&self, image: &mut [u8]) {
        if let [_, _, hi, lo, ..] = image {
            [*hi, *lo] = self.0.to_be_bytes();
        }
    }
}

impl From<u16> for FlashParams {
    fn from(value: u16) -> Self {
        FlashParams(value)
    }
}

impl From<FlashParams> for u16 {
    fn from(params: FlashParams) -> Self {
        params.0
    }
}

impl fmt::Display for FlashParams {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

impl FromStr for FlashParams {
    type Err = Error;

    /// Either `mode,size,frequency` or a number, of which only the lower 16
    /// bits are kept
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();

        match parts[..] {
            [number] => parse_int::parse::<u32>(number)
                .map(|n| FlashParams((n & 0xffff) as u16))
                .map_err(|_| Error::InvalidArgument(format!("invalid number: {number}"))),
            [mode, size, frequency] => {
                let mode = FlashMode::from_str(mode)
                    .map_err(|_| Error::InvalidArgument(format!("invalid flash mode: {mode}")))?;
                let size = FlashSize::from_str(size)
                    .map_err(|_| Error::InvalidArgument(format!("invalid flash size: {size}")))?;
                let frequency = FlashFrequency::from_str(frequency).map_err(|_| {
                    Error::InvalidArgument(format!("invalid flash frequency: {frequency}"))
                })?;

                Ok(FlashParams::new(mode, size, frequency))
            }
            _ => Err(Error::InvalidArgument(
                "flash params must be either a number or a comma-separated list of three items"
                    .into(),
            )),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ParamsRepr {
    Number(u32),
    Text(String),
}

impl TryFrom<ParamsRepr> for FlashParams {
    type Error = Error;

    fn try_from(repr: ParamsRepr) -> Result<Self, Self::Error> {
        match repr {
            ParamsRepr::Number(n) => Ok(FlashParams((n & 0xffff) as u16)),
            ParamsRepr::Text(s) => s.parse(),
        }
    }
}
