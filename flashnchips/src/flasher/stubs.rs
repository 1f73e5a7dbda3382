//! Stub loader module.
//!
//! The flasher stub is not bundled; a descriptor is supplied at runtime,
//! either as TOML with base64 encoded sections or as esptool-style JSON with
//! hex encoded sections.

use std::{fs, path::Path};

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub(crate) const EXPECTED_STUB_HANDSHAKE: &[u8] = b"OHAI";

fn default_num_params() -> usize {
    1
}

/// Flash stub descriptor as stored on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StubDescriptor {
    /// Entry point (address)
    entry: u32,
    /// Number of `u32` parameters placed in front of the code
    #[serde(default = "default_num_params")]
    num_params: usize,
    /// Address of the parameter block, the code follows it
    params_start: u32,
    /// Code section
    code: String,
    /// Data section, may be empty
    #[serde(default)]
    data: String,
    /// Start of data section address
    #[serde(default)]
    data_start: u32,
}

/// A flasher stub ready to be uploaded to RAM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashStub {
    entry: u32,
    num_params: usize,
    params_start: u32,
    code: Vec<u8>,
    data_start: u32,
    data: Vec<u8>,
}

impl FlashStub {
    /// Parse a TOML descriptor with base64 encoded sections
    pub fn from_toml(s: &str) -> Result<Self, Error> {
        let desc: StubDescriptor =
            toml::from_str(s).map_err(|e| Error::InvalidStub(e.to_string()))?;

        let decode = |section: &str, value: &str| {
            general_purpose::STANDARD
                .decode(value)
                .map_err(|e| Error::InvalidStub(format!("{section}: {e}")))
        };

        Self::from_descriptor(&desc, decode)
    }

    /// Parse an esptool-style JSON descriptor with hex encoded sections
    pub fn from_json(s: &str) -> Result<Self, Error> {
        let desc: StubDescriptor =
            serde_json::from_str(s).map_err(|e| Error::InvalidStub(e.to_string()))?;

        let decode = |section: &str, value: &str| {
            hex::decode(value.trim()).map_err(|e| Error::InvalidStub(format!("{section}: {e}")))
        };

        Self::from_descriptor(&desc, decode)
    }

    /// Load a descriptor from disk, picking the format from the extension
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::FileOpenError(path.display().to_string(), e))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(&contents),
            _ => Self::from_toml(&contents),
        }
    }

    fn from_descriptor<F>(desc: &StubDescriptor, decode: F) -> Result<Self, Error>
    where
        F: Fn(&str, &str) -> Result<Vec<u8>, Error>,
    {
        let code = decode("code", &desc.code)?;
        if code.is_empty() {
            return Err(Error::InvalidStub("code section is empty".into()));
        }

        Ok(FlashStub {
            entry: desc.entry,
            num_params: desc.num_params,
            params_start: desc.params_start,
            code,
            data_start: desc.data_start,
            data: decode("data", &desc.data)?,
        })
    }

    /// Fetch stub entry point
    pub fn entry(&self) -> u32 {
        self.entry
    }

    /// Number of parameters the stub expects
    pub fn num_params(&self) -> usize {
        self.num_params
    }

    /// Fetch parameter block address and code bytes
    pub fn code(&self) -> (u32, &[u8]) {
        (self.params_start, &self.code)
    }

    /// Fetch data start address and bytes
    pub fn data(&self) -> (u32, &[u8]) {
        (self.data_start, &self.data)
    }
}

#[cfg(test)]
pub(crate) fn test_stub() -> FlashStub {
    FlashStub {
        entry: crate::testing::SIM_STUB_ENTRY,
        num_params: 1,
        params_start: 0x4010_d000,
        code: vec![0x5a; 5000],
        data_start: 0x3ffe_8000,
        data: vec![0xa5; 100],
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const TOML_STUB: &str = r#"
entry = 1074790404
num_params = 1
params_start = 1074790400
code = "AQIDBA=="
data = "BQY="
data_start = 1073643520
"#;

    #[test]
    fn toml_descriptor() {
        let stub = FlashStub::from_toml(TOML_STUB).unwrap();

        assert_eq!(stub.entry(), 0x4010_0004);
        assert_eq!(stub.code(), (0x4010_0000, &[1u8, 2, 3, 4][..]));
        assert_eq!(stub.data(), (0x3ffe_8000, &[5u8, 6][..]));
    }

    #[test]
    fn json_descriptor_uses_hex() {
        let json = r#"{"entry": 1074790404, "num_params": 1,
            "params_start": 1074790400, "code": "0a0B0c", "data": ""}"#;
        let stub = FlashStub::from_json(json).unwrap();

        assert_eq!(stub.code().1, &[0x0au8, 0x0b, 0x0c]);
        assert!(stub.data().1.is_empty());
        assert_eq!(stub.num_params(), 1);
    }

    #[test]
    fn rejects_bad_sections() {
        let json = r#"{"entry": 1, "params_start": 2, "code": "abc"}"#;
        assert!(matches!(
            FlashStub::from_json(json),
            Err(Error::InvalidStub(_))
        ));

        let json = r#"{"entry": 1, "params_start": 2, "code": "00", "data": "0g"}"#;
        match FlashStub::from_json(json) {
            Err(Error::InvalidStub(message)) => assert!(message.starts_with("data: ")),
            other => panic!("unexpected result: {other:?}"),
        }

        let toml = "entry = 1\nparams_start = 2\ncode = \"\"\n";
        assert!(matches!(
            FlashStub::from_toml(toml),
            Err(Error::InvalidStub(_))
        ));
    }

    #[test]
    fn loads_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"entry": 1, "params_start": 2, "code": "ff"}}"#).unwrap();

        let stub = FlashStub::from_file(file.path()).unwrap();
        assert_eq!(stub.code(), (2, &[0xff][..]));
    }
}
