//! IV validation for tunnel hops.

use std::sync::Arc;

use hopnet_types::clock::Clock;
use tracing::warn;

use crate::bloom::{DecayingBloomFilter, DEFAULT_DECAY_MS, DEFAULT_LOG2_BITS};
use crate::{ReplayError, Result};

/// Replay oracle shared by every hop transform on a router.
pub trait IvValidator: Send + Sync {
    /// Returns `true` if the cell identified by `iv` and the first 16 bytes
    /// of its body has not been seen recently. Records it either way.
    fn receive_iv(&self, iv: &[u8; 16], body_head: &[u8; 16]) -> bool;
}

/// [`IvValidator`] backed by a [`DecayingBloomFilter`].
///
/// The filter key is `IV XOR body_head`, which ties the check to the cell
/// contents and not the IV alone.
pub struct BloomFilterIvValidator {
    filter: DecayingBloomFilter,
}

impl BloomFilterIvValidator {
    /// Create a validator with the default filter size and decay period.
    pub fn new(clock: Arc<dyn Clock>) -> Result<Self> {
        Self::with_params(DEFAULT_LOG2_BITS, DEFAULT_DECAY_MS, clock)
    }

    /// Create a validator with an explicit filter size and decay period.
    pub fn with_params(log2_bits: u32, decay_ms: u64, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self {
            filter: DecayingBloomFilter::new(log2_bits, decay_ms, clock)?,
        })
    }

    /// Like [`IvValidator::receive_iv`], but reports a replay as an error.
    ///
    /// # Errors
    ///
    /// - [`ReplayError::Duplicate`] if the pair was seen within the decay window
    pub fn check(&self, iv: &[u8; 16], body_head: &[u8; 16]) -> Result<()> {
        let mut key = [0u8; 16];
        for (k, (a, b)) in key.iter_mut().zip(iv.iter().zip(body_head.iter())) {
            *k = a ^ b;
        }
        if self.filter.add(&key) {
            return Err(ReplayError::Duplicate);
        }
        Ok(())
    }

    /// Cells rejected as replays so far.
    pub fn duplicates(&self) -> u64 {
        self.filter.duplicates()
    }

    /// Cells accepted so far.
    pub fn accepted(&self) -> u64 {
        self.filter.inserted()
    }
}

impl IvValidator for BloomFilterIvValidator {
    fn receive_iv(&self, iv: &[u8; 16], body_head: &[u8; 16]) -> bool {
        match self.check(iv, body_head) {
            Ok(()) => true,
            Err(e) => {
                warn!("dropping cell: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hopnet_types::clock::ManualClock;

    fn validator() -> BloomFilterIvValidator {
        BloomFilterIvValidator::with_params(16, 60_000, Arc::new(ManualClock::new(0)))
            .expect("validator")
    }

    #[test]
    fn test_replay_rejected() {
        let v = validator();
        let iv = [1u8; 16];
        let head = [2u8; 16];
        assert!(v.receive_iv(&iv, &head));
        assert!(!v.receive_iv(&iv, &head));
        assert_eq!(v.accepted(), 1);
        assert_eq!(v.duplicates(), 1);
    }

    #[test]
    fn test_same_iv_different_body_accepted() {
        let v = validator();
        assert!(v.receive_iv(&[1u8; 16], &[2u8; 16]));
        assert!(v.receive_iv(&[1u8; 16], &[3u8; 16]));
    }

    #[test]
    fn test_key_is_xor() {
        let v = validator();
        // Equal XOR, different halves: treated as the same cell.
        assert!(v.receive_iv(&[0x0F; 16], &[0xF0; 16]));
        assert!(matches!(
            v.check(&[0xFF; 16], &[0x00; 16]),
            Err(ReplayError::Duplicate)
        ));
    }
}
