//! Firmware images
//!
//! A firmware is a set of binary blobs, each destined for a fixed flash
//! offset, plus an optional set of named files for the on-device
//! filesystem.

use std::{
    collections::BTreeMap,
    fs,
    ops::Bound::{Excluded, Unbounded},
    path::Path,
};

use log::debug;
use regex::Regex;

use crate::{
    error::Error,
    fs::merge::FileSet,
    targets::esp8266::{FLASH_SECTOR_SIZE, IMAGE_MAGIC, SYSTEM_PARAMS_SIZE},
};

/// Name of the directory holding the filesystem files
pub const FS_DIR: &str = "fs";

/// A firmware ready to be flashed
///
/// Blobs never overlap each other.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareImage {
    blobs: BTreeMap<u32, Vec<u8>>,
    files: FileSet,
}

impl FirmwareImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an image from `(offset, data)` pairs
    pub fn from_blobs<I>(blobs: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (u32, Vec<u8>)>,
    {
        let mut image = FirmwareImage::new();
        for (addr, data) in blobs {
            image.insert(addr, data)?;
        }
        Ok(image)
    }

    /// Load a firmware directory
    ///
    /// Every `0x<offset>.bin` file becomes a blob at that offset, every file
    /// in the `fs` subdirectory a filesystem file.
    pub fn load_dir(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let pattern = Regex::new(r"^(0x[0-9a-fA-F]+)\.bin$").map_err(|_| Error::InternalError)?;
        let mut image = FirmwareImage::new();

        for entry in read_dir(path)? {
            let entry = entry.map_err(|e| Error::FileOpenError(path.display().to_string(), e))?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(offset) = pattern.captures(name).and_then(|c| c.get(1)) else {
                continue;
            };
            if !entry.path().is_file() {
                continue;
            }

            let addr = parse_int::parse::<u32>(offset.as_str())
                .map_err(|_| Error::InvalidArgument(format!("offset out of range: {name}")))?;
            let data = read_file(&entry.path())?;
            debug!("Loaded {name}: {} bytes at {addr:#x}", data.len());

            image.insert(addr, data)?;
        }

        let fs_dir = path.join(FS_DIR);
        if fs_dir.is_dir() {
            for entry in read_dir(&fs_dir)? {
                let entry =
                    entry.map_err(|e| Error::FileOpenError(fs_dir.display().to_string(), e))?;
                if !entry.path().is_file() {
                    continue;
                }

                let name = entry.file_name().to_string_lossy().into_owned();
                let data = read_file(&entry.path())?;
                debug!("Loaded filesystem file {name}: {} bytes", data.len());

                image.add_file(name, data);
            }
        }

        Ok(image)
    }

    /// Add a blob at `addr`, replacing any blob already there
    pub fn insert(&mut self, addr: u32, data: Vec<u8>) -> Result<(), Error> {
        let end = addr as u64 + data.len() as u64;

        let before = self.blobs.range(..addr).next_back();
        if let Some((&other, blob)) = before {
            if other as u64 + blob.len() as u64 > addr as u64 {
                return Err(overlap(other, addr));
            }
        }

        let after = self.blobs.range((Excluded(addr), Unbounded)).next();
        if let Some((&other, _)) = after {
            if end > other as u64 {
                return Err(overlap(addr, other));
            }
        }

        self.blobs.insert(addr, data);
        Ok(())
    }

    pub fn remove(&mut self, addr: u32) -> Option<Vec<u8>> {
        self.blobs.remove(&addr)
    }

    pub fn get(&self, addr: u32) -> Option<&[u8]> {
        self.blobs.get(&addr).map(Vec::as_slice)
    }

    /// Mutable access to the contents of a blob, its length is fixed
    pub fn get_mut(&mut self, addr: u32) -> Option<&mut [u8]> {
        self.blobs.get_mut(&addr).map(Vec::as_mut_slice)
    }

    pub fn contains(&self, addr: u32) -> bool {
        self.blobs.contains_key(&addr)
    }

    pub fn blobs(&self) -> &BTreeMap<u32, Vec<u8>> {
        &self.blobs
    }

    pub fn add_file(&mut self, name: impl Into<String>, data: Vec<u8>) {
        self.files.insert(name.into(), data);
    }

    pub fn files(&self) -> &FileSet {
        &self.files
    }

    /// Combined length of all blobs
    pub fn len(&self) -> usize {
        self.blobs.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Check that the blobs can be written to a flash of `flash_size` bytes
    pub fn sanity_check(&self, flash_size: usize) -> Result<(), Error> {
        let system_params = flash_size.saturating_sub(SYSTEM_PARAMS_SIZE);

        for (&addr, data) in &self.blobs {
            let start = addr as usize;
            let end = start + data.len();

            if start >= flash_size || end > flash_size {
                return Err(Error::InvalidArgument(format!(
                    "image of {} bytes at {addr:#x} does not fit in flash of {flash_size} bytes",
                    data.len()
                )));
            }
            if start % FLASH_SECTOR_SIZE != 0 {
                return Err(Error::InvalidArgument(format!(
                    "image at {addr:#x} does not start on a sector boundary"
                )));
            }
            if start == 0 && data.first().is_some_and(|&b| b != IMAGE_MAGIC) {
                return Err(Error::InvalidArgument(
                    "invalid magic byte in the image at 0x0".into(),
                ));
            }
            if start < flash_size && end > system_params {
                return Err(Error::InvalidArgument(format!(
                    "image at {addr:#x} overlaps the system parameters at {system_params:#x}"
                )));
            }
        }

        Ok(())
    }
}

fn overlap(first: u32, second: u32) -> Error {
    Error::InvalidArgument(format!(
        "images at {first:#x} and {second:#x} overlap"
    ))
}

fn read_dir(path: &Path) -> Result<fs::ReadDir, Error> {
    fs::read_dir(path).map_err(|e| Error::FileOpenError(path.display().to_string(), e))
}

fn read_file(path: &Path) -> Result<Vec<u8>, Error> {
    fs::read(path).map_err(|e| Error::FileOpenError(path.display().to_string(), e))
}
