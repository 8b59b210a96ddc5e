//! BLAKE3 hashing.
//!
//! - [`hash`] — Plain 32-byte digest
//! - [`keyed_xof`] — Keyed extendable output, used by the replay filter to
//!   derive many independent bit positions from one pass over the input

/// Compute the BLAKE3 hash of the input data.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *::blake3::hash(data).as_bytes()
}

/// Fill `output` with keyed BLAKE3 extendable output over `data`.
pub fn keyed_xof(key: &[u8; 32], data: &[u8], output: &mut [u8]) {
    let mut hasher = ::blake3::Hasher::new_keyed(key);
    hasher.update(data);
    let mut reader = hasher.finalize_xof();
    reader.fill(output);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        assert_eq!(hash(b"hopnet"), hash(b"hopnet"));
        assert_ne!(hash(b"input1"), hash(b"input2"));
    }

    #[test]
    fn test_keyed_xof_depends_on_key() {
        let mut a = [0u8; 44];
        let mut b = [0u8; 44];
        keyed_xof(&[1u8; 32], b"entry", &mut a);
        keyed_xof(&[2u8; 32], b"entry", &mut b);
        assert_ne!(a, b);

        let mut again = [0u8; 44];
        keyed_xof(&[1u8; 32], b"entry", &mut again);
        assert_eq!(a, again);
    }

    #[test]
    fn test_keyed_xof_prefix_stable() {
        let mut short = [0u8; 8];
        let mut long = [0u8; 64];
        keyed_xof(&[9u8; 32], b"x", &mut short);
        keyed_xof(&[9u8; 32], b"x", &mut long);
        assert_eq!(short, long[..8]);
    }
}
