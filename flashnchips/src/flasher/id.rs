//! Device identity block
//!
//! The block lives in its own sector and holds the SHA-1 of a JSON payload,
//! the payload itself and a terminating NUL. The rest of the sector is left
//! erased.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use serde_json::json;
use sha1::{Digest, Sha1};

use crate::targets::esp8266::FLASH_SECTOR_SIZE;

/// Flash offset of the ID block
pub const ID_BLOCK_OFFSET: u32 = 0x10000;
/// Size of the ID block on flash
pub const ID_BLOCK_SIZE: usize = FLASH_SECTOR_SIZE;

const HASH_LEN: usize = 20;

/// Create a new ID block for a device registered at `domain`
pub fn make_id_block(domain: &str) -> Vec<u8> {
    let payload = json!({
        "id": format!("//{domain}/d/{}", random_token(5)),
        "key": random_token(16),
    })
    .to_string();

    let mut block = Vec::with_capacity(ID_BLOCK_SIZE);
    block.extend_from_slice(&Sha1::digest(payload.as_bytes()));
    block.extend_from_slice(payload.as_bytes());
    block.push(0);
    if block.len() < ID_BLOCK_SIZE {
        block.resize(ID_BLOCK_SIZE, 0xff);
    }

    block
}

/// Whether `block` holds a valid ID block
pub fn find_id(block: &[u8]) -> bool {
    id_payload(block).is_some()
}

/// The JSON payload of a valid ID block
pub fn id_payload(block: &[u8]) -> Option<&[u8]> {
    if block.len() <= HASH_LEN {
        return None;
    }

    let (hash, rest) = block.split_at(HASH_LEN);
    let end = rest.iter().position(|&b| b == 0)?;
    let payload = &rest[..end];

    (Sha1::digest(payload)[..] == *hash).then_some(payload)
}

fn random_token(len: usize) -> String {
    let mut bytes = vec![0; len];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
