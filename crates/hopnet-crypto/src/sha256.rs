//! SHA-256 helpers.
//!
//! The tunnel cell carries the first 4 bytes of a SHA-256 digest as its
//! integrity tag, and every I2NP-style message header carries the first
//! byte of the SHA-256 of its payload.

use sha2::{Digest, Sha256};

/// Compute the SHA-256 digest of `data`.
pub fn hash(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Compute the SHA-256 digest of the concatenation of `parts`.
pub fn hash_parts(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// First four bytes of the SHA-256 of the concatenated `parts`.
pub fn truncated4(parts: &[&[u8]]) -> [u8; 4] {
    let digest = hash_parts(parts);
    [digest[0], digest[1], digest[2], digest[3]]
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_sha256_known_answer() {
        assert_eq!(
            hash(b"abc"),
            hex!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn test_hash_parts_matches_concatenation() {
        assert_eq!(hash_parts(&[b"ab", b"c"]), hash(b"abc"));
        assert_eq!(hash_parts(&[]), hash(b""));
    }

    #[test]
    fn test_truncated4() {
        assert_eq!(truncated4(&[b"abc"]), hex!("ba7816bf"));
    }
}
