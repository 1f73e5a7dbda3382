//! Merging of filesystem images
//!
//! Files on the device are kept unless the new firmware carries a file with
//! the same name. Nothing is ever deleted.

use std::collections::BTreeMap;

use log::{debug, info};

use crate::{
    error::Error,
    fs::{Filesystem, MemStorage},
};

pub type FileSet = BTreeMap<String, Vec<u8>>;

/// Overlay `new` onto `base`
pub fn merge_files(mut base: FileSet, new: &FileSet) -> FileSet {
    for (name, data) in new {
        if base.contains_key(name) {
            debug!("Replacing {name}");
        } else {
            debug!("Adding {name}");
        }
        base.insert(name.clone(), data.clone());
    }
    base
}

/// All files of the filesystem held by `image`
pub fn read_files(image: &[u8]) -> Result<FileSet, Error> {
    Filesystem::mount(MemStorage::from(image.to_vec()))?.read_all()
}

/// A freshly formatted image of `capacity` bytes holding `files`
///
/// Files are written in name order.
pub fn build_image(files: &FileSet, capacity: usize) -> Result<Vec<u8>, Error> {
    let mut fs = Filesystem::format(MemStorage::new(capacity))?;
    for (name, data) in files {
        fs.write(name, data)?;
    }
    Ok(fs.into_storage().into_inner())
}

/// Merge the files of the `new` image into the `old` one
///
/// The result has the capacity of `old`.
pub fn merge_filesystems(old: &[u8], new: &[u8]) -> Result<Vec<u8>, Error> {
    let merged = merge_files(read_files(old)?, &read_files(new)?);
    build_image(&merged, old.len())
}

/// Merge the files of the `new` image, then the loose `files`, into the
/// `old` image
pub fn merge_image(old: &[u8], new: Option<&[u8]>, files: &FileSet) -> Result<Vec<u8>, Error> {
    let mut merged = read_files(old)?;
    if let Some(new) = new {
        merged = merge_files(merged, &read_files(new)?);
    }
    merged = merge_files(merged, files);

    info!("Merged filesystem holds {} files", merged.len());
    build_image(&merged, old.len())
}
