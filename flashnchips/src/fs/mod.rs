//! Flat, append-only filesystem images
//!
//! An image is a sequence of 256 byte pages. The first page holds the
//! [header](FsHeader), every file version after it is a record starting on a
//! page boundary. Writing a file appends a new record with a higher sequence
//! number, deleting one appends a record flagged as deleted, so the newest
//! record of every name wins when the image is mounted.
//!
//! A [Filesystem] owns its [Storage], any number of them can be mounted at
//! the same time.

use std::collections::BTreeMap;

use bytemuck::{bytes_of, pod_read_unaligned, Pod, Zeroable};
use log::debug;

use crate::error::Error;

pub mod merge;

pub const PAGE_SIZE: usize = 256;
/// Longest file name a record may carry
pub const MAX_NAME_LEN: usize = 32;

const FS_MAGIC: [u8; 4] = *b"FNCF";
const FS_VERSION: u16 = 1;
const RECORD_MAGIC: u16 = 0x5aa5;
const ERASED_MAGIC: u16 = 0xffff;
const FLAG_DELETED: u8 = 1 << 0;

/// Fields are stored little endian
#[derive(Copy, Clone, Debug, Zeroable, Pod)]
#[repr(C)]
struct FsHeader {
    magic: [u8; 4],
    version: u16,
    page_size: u16,
    capacity: u32,
}

#[derive(Copy, Clone, Debug, Zeroable, Pod)]
#[repr(C)]
struct RecordHeader {
    magic: u16,
    name_len: u8,
    flags: u8,
    sequence: u32,
    data_len: u32,
}

const RECORD_HEADER_LEN: usize = std::mem::size_of::<RecordHeader>();

/// Backing store of a filesystem image
pub trait Storage {
    /// Size of the storage in bytes
    fn capacity(&self) -> usize;

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), Error>;

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), Error>;

    /// Reset `len` bytes at `offset` to the erased state
    fn erase(&mut self, offset: usize, len: usize) -> Result<(), Error>;
}

/// Storage kept in memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemStorage(Vec<u8>);

impl MemStorage {
    /// Erased storage of `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        MemStorage(vec![0xff; capacity])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }

    fn range(&self, offset: usize, len: usize) -> Result<std::ops::Range<usize>, Error> {
        match offset.checked_add(len) {
            Some(end) if end <= self.0.len() => Ok(offset..end),
            _ => Err(Error::InvalidArgument(format!(
                "access of {len} bytes at {offset:#x} is out of bounds"
            ))),
        }
    }
}

impl From<Vec<u8>> for MemStorage {
    fn from(data: Vec<u8>) -> Self {
        MemStorage(data)
    }
}

impl Storage for MemStorage {
    fn capacity(&self) -> usize {
        self.0.len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), Error> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.0[range]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), Error> {
        let range = self.range(offset, data.len())?;
        self.0[range].copy_from_slice(data);
        Ok(())
    }

    fn erase(&mut self, offset: usize, len: usize) -> Result<(), Error> {
        let range = self.range(offset, len)?;
        self.0[range].fill(0xff);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    /// Offset of the file contents
    offset: usize,
    len: usize,
    sequence: u32,
    deleted: bool,
}

/// A mounted filesystem image
#[derive(Debug)]
pub struct Filesystem<S: Storage> {
    storage: S,
    entries: BTreeMap<String, Entry>,
    /// Offset of the first free page
    end: usize,
    sequence: u32,
}

impl<S: Storage> Filesystem<S> {
    /// Create an empty filesystem on `storage`, discarding its contents
    pub fn format(mut storage: S) -> Result<Self, Error> {
        let capacity = storage.capacity();
        if capacity < PAGE_SIZE || capacity % PAGE_SIZE != 0 || capacity > u32::MAX as usize {
            return Err(Error::InvalidArgument(format!(
                "invalid filesystem size: {capacity} bytes"
            )));
        }

        let header = FsHeader {
            magic: FS_MAGIC,
            version: FS_VERSION.to_le(),
            page_size: (PAGE_SIZE as u16).to_le(),
            capacity: (capacity as u32).to_le(),
        };

        storage.erase(0, capacity)?;
        storage.write(0, bytes_of(&header))?;

        Ok(Filesystem {
            storage,
            entries: BTreeMap::new(),
            end: PAGE_SIZE,
            sequence: 0,
        })
    }

    /// Mount the filesystem held by `storage`
    pub fn mount(storage: S) -> Result<Self, Error> {
        let capacity = storage.capacity();
        if capacity < PAGE_SIZE {
            return Err(Error::Mount(format!("image too small: {capacity} bytes")));
        }

        let mut raw = [0; std::mem::size_of::<FsHeader>()];
        storage.read(0, &mut raw)?;
        let header: FsHeader = pod_read_unaligned(&raw);

        if header.magic != FS_MAGIC {
            return Err(Error::Mount(format!("bad magic: {:02x?}", header.magic)));
        }
        if u16::from_le(header.version) != FS_VERSION {
            return Err(Error::Mount(format!(
                "unsupported version {}",
                u16::from_le(header.version)
            )));
        }
        if u16::from_le(header.page_size) as usize != PAGE_SIZE {
            return Err(Error::Mount(format!(
                "unsupported page size {}",
                u16::from_le(header.page_size)
            )));
        }
        if u32::from_le(header.capacity) as usize != capacity {
            return Err(Error::Mount(format!(
                "header says {} bytes, image has {capacity}",
                u32::from_le(header.capacity)
            )));
        }

        let mut fs = Filesystem {
            storage,
            entries: BTreeMap::new(),
            end: PAGE_SIZE,
            sequence: 0,
        };
        fs.scan()?;

        debug!(
            "Mounted filesystem: {} files, {} of {capacity} bytes used",
            fs.entries.values().filter(|e| !e.deleted).count(),
            fs.end
        );
        Ok(fs)
    }

    fn scan(&mut self) -> Result<(), Error> {
        let capacity = self.storage.capacity();
        let mut offset = PAGE_SIZE;

        while offset + RECORD_HEADER_LEN <= capacity {
            let mut raw = [0; RECORD_HEADER_LEN];
            self.storage.read(offset, &mut raw)?;
            let record: RecordHeader = pod_read_unaligned(&raw);

            match u16::from_le(record.magic) {
                ERASED_MAGIC => break,
                RECORD_MAGIC => {}
                other => {
                    return Err(Error::Mount(format!(
                        "bad record magic {other:#06x} at {offset:#x}"
                    )))
                }
            }

            let name_len = record.name_len as usize;
            if name_len == 0 || name_len > MAX_NAME_LEN {
                return Err(Error::Mount(format!(
                    "bad name length {name_len} at {offset:#x}"
                )));
            }

            let data_offset = offset + RECORD_HEADER_LEN + name_len;
            let data_len = u32::from_le(record.data_len) as usize;
            let end = data_offset
                .checked_add(data_len)
                .filter(|&end| end <= capacity)
                .ok_or_else(|| {
                    Error::Mount(format!("record at {offset:#x} exceeds the image"))
                })?;

            let mut name = vec![0; name_len];
            self.storage.read(offset + RECORD_HEADER_LEN, &mut name)?;
            let name = String::from_utf8(name)
                .map_err(|_| Error::Mount(format!("file name at {offset:#x} is not UTF-8")))?;

            let sequence = u32::from_le(record.sequence);
            self.sequence = self.sequence.max(sequence);

            let entry = Entry {
                offset: data_offset,
                len: data_len,
                sequence,
                deleted: record.flags & FLAG_DELETED != 0,
            };
            match self.entries.get(&name) {
                Some(existing) if existing.sequence > sequence => {}
                _ => {
                    self.entries.insert(name, entry);
                }
            }

            offset = end.next_multiple_of(PAGE_SIZE);
        }

        self.end = offset.min(capacity);
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.storage.capacity()
    }

    /// Bytes still available for new records
    pub fn free(&self) -> usize {
        self.capacity() - self.end
    }

    /// Names and sizes of all files, ordered by name
    pub fn list(&self) -> impl Iterator<Item = (&str, usize)> {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.deleted)
            .map(|(name, entry)| (name.as_str(), entry.len))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.get(name).is_some_and(|entry| !entry.deleted)
    }

    /// Contents of the file called `name`
    pub fn read(&self, name: &str) -> Result<Vec<u8>, Error> {
        let entry = self
            .entries
            .get(name)
            .filter(|entry| !entry.deleted)
            .ok_or_else(|| Error::InvalidArgument(format!("no such file: {name}")))?;

        let mut data = vec![0; entry.len];
        self.storage.read(entry.offset, &mut data)?;
        Ok(data)
    }

    /// Contents of every file, keyed by name
    pub fn read_all(&self) -> Result<BTreeMap<String, Vec<u8>>, Error> {
        self.list()
            .map(|(name, _)| Ok((name.to_string(), self.read(name)?)))
            .collect()
    }

    /// Create or replace the file called `name`
    pub fn write(&mut self, name: &str, data: &[u8]) -> Result<(), Error> {
        self.append(name, data, 0)
    }

    pub fn delete(&mut self, name: &str) -> Result<(), Error> {
        if !self.contains(name) {
            return Err(Error::InvalidArgument(format!("no such file: {name}")));
        }
        self.append(name, &[], FLAG_DELETED)
    }

    fn append(&mut self, name: &str, data: &[u8], flags: u8) -> Result<(), Error> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(Error::InvalidArgument(format!(
                "file name must be 1 to {MAX_NAME_LEN} bytes long: {name:?}"
            )));
        }

        let len = RECORD_HEADER_LEN + name.len() + data.len();
        if len > self.free() {
            return Err(Error::FilesystemFull {
                name: name.to_string(),
                size: data.len(),
            });
        }

        let sequence = self.sequence + 1;
        let header = RecordHeader {
            magic: RECORD_MAGIC.to_le(),
            name_len: name.len() as u8,
            flags,
            sequence: sequence.to_le(),
            data_len: (data.len() as u32).to_le(),
        };

        let mut record = Vec::with_capacity(len.next_multiple_of(PAGE_SIZE));
        record.extend_from_slice(bytes_of(&header));
        record.extend_from_slice(name.as_bytes());
        record.extend_from_slice(data);
        record.resize(len.next_multiple_of(PAGE_SIZE).min(self.free()), 0xff);

        self.storage.write(self.end, &record)?;

        self.entries.insert(
            name.to_string(),
            Entry {
                offset: self.end + RECORD_HEADER_LEN + name.len(),
                len: data.len(),
                sequence,
                deleted: flags & FLAG_DELETED != 0,
            },
        );
        self.end += record.len();
        self.sequence = sequence;

        Ok(())
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }
}
