use sha2::{Digest as _, Sha256};

pub const DIGEST_SIZE: usize = 16;

/// Truncated key hash used to address index rows.
pub type Digest = [u8; DIGEST_SIZE];

/// Low 128 bits of the SHA-256 of the key's UTF-8 bytes.
///
/// Keys are not stored, so two keys sharing a digest resolve to the same row.
pub fn digest(key: &str) -> Digest {
    let hash = Sha256::digest(key.as_bytes());
    let mut truncated = [0u8; DIGEST_SIZE];
    truncated.copy_from_slice(&hash[DIGEST_SIZE..]);
    truncated
}

/// Home slot of a digest in a table of `capacity` rows.
pub fn home_slot(digest: &Digest, capacity: u32) -> u32 {
    (u128::from_be_bytes(*digest) % capacity as u128) as u32
}
