//! # hopnet-crypto
//!
//! Symmetric primitives for the hopnet tunnel data plane.
//!
//! The suite is fixed; there is no algorithm negotiation between hops.
//!
//! ## Modules
//!
//! - [`aes256`] — AES-256 per-hop layer cipher (IV-key block step + layer-key CBC chain)
//! - [`sha256`] — SHA-256 for cell checksums and message checksums
//! - [`blake3`] — Keyed BLAKE3 XOF used to derive filter bit positions
//! - [`keys`] — Zeroizing 256-bit session keys
//!
//! ## Key Parameters
//!
//! | Parameter | Value |
//! |---|---|
//! | Cipher | AES-256 |
//! | Block size | 16 bytes |
//! | Key size | 32 bytes |
//! | IV size | 16 bytes |

pub mod aes256;
pub mod blake3;
pub mod keys;
pub mod sha256;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// AES-256 key size in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of the IV carried at the front of every tunnel cell.
pub const IV_SIZE: usize = 16;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Buffer is not an IV followed by whole cipher blocks.
    #[error("unaligned buffer: {len} bytes is not {iv} + n * {block}", iv = IV_SIZE, block = BLOCK_SIZE)]
    UnalignedBuffer { len: usize },

    /// Invalid input data.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(BLOCK_SIZE, 16);
        assert_eq!(KEY_SIZE, 32);
        assert_eq!(IV_SIZE, BLOCK_SIZE);
    }

    #[test]
    fn test_error_display() {
        let err = CryptoError::UnalignedBuffer { len: 17 };
        assert!(err.to_string().contains("17 bytes"));
    }
}
