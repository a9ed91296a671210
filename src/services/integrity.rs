//! Per-chunk content hashing.
//!
//! SHA-1 matches the part-verification header of the remote store; it is not
//! relied on for collision resistance.

use sha1::{Digest, Sha1};

/// Lowercase hex SHA-1 of `bytes`.
pub fn hash_chunk(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// True when `bytes` hash to `expected` (hex, case-insensitive).
pub fn verify_chunk(expected: &str, bytes: &[u8]) -> bool {
    hash_chunk(bytes).eq_ignore_ascii_case(expected.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digests() {
        assert_eq!(hash_chunk(b""), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
        assert_eq!(hash_chunk(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn verify_accepts_uppercase_and_rejects_corruption() {
        assert!(verify_chunk("A9993E364706816ABA3E25717850C26C9CD0D89D", b"abc"));
        assert!(!verify_chunk("a9993e364706816aba3e25717850c26c9cd0d89d", b"abd"));
    }
}
