//! 256-bit symmetric keys for tunnel layers.
//!
//! Every hop holds two of these: the layer key that drives the CBC chain over
//! the cell body, and the IV key that scrambles the IV before and after it.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{CryptoError, Result, KEY_SIZE};

/// A 256-bit AES session key. Wiped from memory on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey {
    bytes: [u8; KEY_SIZE],
}

impl SessionKey {
    /// Generate a fresh random key from the OS RNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Create from a slice, checking the length.
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_SIZE] =
            slice
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: KEY_SIZE,
                    actual: slice.len(),
                })?;
        Ok(Self { bytes })
    }

    /// Borrow the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only a short fingerprint, never the key itself.
        let fp = crate::blake3::hash(&self.bytes);
        write!(f, "SessionKey({})", hex::encode(&fp[..4]))
    }
}
