//! Command-line interface configuration
//!
//! The [Config] type is loaded from `flashnchips.toml`, which is looked for
//! in the current directory and then in the user's configuration directory.
//! Command-line flags override whatever the file says.

use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
};

use directories::ProjectDirs;
use log::debug;
use miette::{IntoDiagnostic, Result, WrapErr};
use serde::{Deserialize, Serialize};

use crate::{error::Error, flasher::FlasherConfig};

pub const CONFIG_FILE: &str = "flashnchips.toml";

/// A configured, known serial connection
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Connection {
    /// Name of the serial port used for communication
    pub serial: Option<String>,
    /// Baud rate used once the flasher stub is running
    pub baud: Option<u32>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub connection: Connection,
    pub flasher: FlasherConfig,
}

impl Config {
    /// Load the configuration file, or the defaults if there is none
    pub fn load() -> Result<Self> {
        match Self::config_path()? {
            Some(path) => Self::load_from(&path),
            None => {
                debug!("No {CONFIG_FILE} found, using defaults");
                Ok(Config::default())
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let data = read_to_string(path)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to read {}", path.display()))?;

        let config: Config = toml::from_str(&data)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to parse {}", path.display()))?;

        debug!("Config from {}: {config:#?}", path.display());
        Ok(config)
    }

    /// The flasher configuration with the connection table applied
    pub fn flasher_config(&self) -> FlasherConfig {
        let mut config = self.flasher.clone();
        if let Some(baud) = self.connection.baud {
            config.flash_baud_rate = baud;
        }
        config
    }

    fn config_path() -> Result<Option<PathBuf>, Error> {
        let local_config = std::env::current_dir()?.join(CONFIG_FILE);
        if local_config.exists() {
            return Ok(Some(local_config));
        }

        let global_config = ProjectDirs::from("com", "flashnchips", "flashnchips")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
            .filter(|path| path.exists());
        Ok(global_config)
    }
}
