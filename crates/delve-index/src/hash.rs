//! Content hashing for files and chunks.

/// Length of a hex-encoded digest.
pub const HASH_LEN: usize = 64;

/// BLAKE3 digest of `bytes` as 64 lowercase hex characters.
#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Whether `s` has the shape of a digest produced by [`content_hash`].
#[must_use]
pub fn is_valid_hash(s: &str) -> bool {
    s.len() == HASH_LEN && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// First 16 hex characters of the digest, used to derive table names.
pub(crate) fn short_hash(bytes: &[u8]) -> String {
    let mut full = content_hash(bytes);
    full.truncate(16);
    full
}
