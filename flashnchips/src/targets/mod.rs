//! Flashable target devices
//!
//! Only the ESP8266 is supported. Its ROM bootloader is driven just far
//! enough to upload the flasher stub, which then does the heavy lifting.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, VariantNames};

pub use self::esp8266::{Esp8266, MacAddress};

pub(crate) mod esp8266;

/// All supported devices
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Display,
    EnumIter,
    EnumString,
    VariantNames,
    Serialize,
    Deserialize,
)]
#[non_exhaustive]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Chip {
    /// ESP8266, ESP8285
    #[default]
    Esp8266,
}
