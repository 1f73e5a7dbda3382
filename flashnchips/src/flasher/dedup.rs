//! Write minimization
//!
//! Flash blocks which already hold the desired content are dropped from the
//! write set. Runs of consecutive differing blocks are kept together, so the
//! result has as few images as the content allows.

use std::collections::BTreeMap;

use log::{debug, warn};
use md5::{Digest, Md5};

use crate::{
    error::Error,
    flasher::client::{DigestResult, StubClient},
};

/// Anything able to compute digests of flash regions on the device
pub trait DigestSource {
    fn digest(&mut self, addr: u32, size: usize, block_size: usize)
        -> Result<DigestResult, Error>;
}

impl DigestSource for StubClient {
    fn digest(
        &mut self,
        addr: u32,
        size: usize,
        block_size: usize,
    ) -> Result<DigestResult, Error> {
        StubClient::digest(self, addr, size, block_size)
    }
}

/// Reduce `images` to the parts which differ from the device's flash
///
/// `skipped` is called with the length of every block which does not need to
/// be written. When the device cannot compute the digests of an image, the
/// whole image is kept.
pub fn dedup_images<D, F>(
    device: &mut D,
    images: &BTreeMap<u32, Vec<u8>>,
    block_size: usize,
    mut skipped: F,
) -> BTreeMap<u32, Vec<u8>>
where
    D: DigestSource + ?Sized,
    F: FnMut(usize),
{
    let mut result = BTreeMap::new();

    for (&addr, data) in images {
        let digests = match device.digest(addr, data.len(), block_size) {
            Ok(digests) => digests,
            Err(e) => {
                warn!("Failed to compute digest of {addr:#x}, writing it whole: {e}");
                result.insert(addr, data.clone());
                continue;
            }
        };

        let runs = differing_runs(addr, data, block_size, &digests.block_digests);
        let kept: usize = runs.values().map(Vec::len).sum();
        debug!(
            "Image at {addr:#x}: {} of {} bytes differ in {} run(s)",
            kept,
            data.len(),
            runs.len()
        );

        skipped(data.len() - kept);
        result.extend(runs);
    }

    result
}

/// Split `data` into runs of blocks whose MD5 differs from `block_digests`
///
/// A block without a digest counts as differing.
pub fn differing_runs(
    addr: u32,
    data: &[u8],
    block_size: usize,
    block_digests: &[[u8; 16]],
) -> BTreeMap<u32, Vec<u8>> {
    let mut runs = BTreeMap::new();
    if block_size == 0 {
        runs.insert(addr, data.to_vec());
        return runs;
    }

    let mut run: Option<(usize, usize)> = None;
    for (i, block) in data.chunks(block_size).enumerate() {
        let offset = i * block_size;
        let same = block_digests
            .get(i)
            .is_some_and(|digest| Md5::digest(block)[..] == digest[..]);

        if same {
            if let Some((start, end)) = run.take() {
                runs.insert(addr + start as u32, data[start..end].to_vec());
            }
        } else {
            let start = run.map_or(offset, |(start, _)| start);
            run = Some((start, offset + block.len()));
        }
    }

    if let Some((start, end)) = run {
        runs.insert(addr + start as u32, data[start..end].to_vec());
    }

    runs
}
