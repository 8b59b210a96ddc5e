//! Decaying Bloom filter.
//!
//! ## Parameters
//!
//! - [`DEFAULT_LOG2_BITS`] = 23 (8,388,608 bits, 1 MiB per generation)
//! - [`NUM_HASH_FNS`] = 11
//! - [`DEFAULT_DECAY_MS`] = 10 minutes
//! - Hash function: keyed BLAKE3 XOF over the entry, split into 4-byte positions.
//!   The key is random per filter so positions cannot be predicted by peers.
//!
//! Two generations are kept. An entry counts as seen if it is present in
//! either. On each decay the current generation becomes the previous one and
//! a cleared array becomes current.
//!
//! Inserts only take the read side of the generation lock and set bits with
//! atomic `fetch_or`, so hops of unrelated tunnels never serialize on one
//! another. Only the decay swap takes the write side.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use hopnet_types::clock::Clock;
use rand::RngCore;
use tracing::debug;

use crate::{ReplayError, Result};

/// Default filter size as a power of two, in bits.
pub const DEFAULT_LOG2_BITS: u32 = 23;

/// Number of hash functions.
pub const NUM_HASH_FNS: usize = 11;

/// Default decay period (10 minutes).
pub const DEFAULT_DECAY_MS: u64 = 10 * 60 * 1000;

const MIN_LOG2_BITS: u32 = 10;
const MAX_LOG2_BITS: u32 = 30;

struct Generations {
    current: Box<[AtomicU64]>,
    previous: Box<[AtomicU64]>,
}

/// A Bloom filter whose entries expire after one to two decay periods.
pub struct DecayingBloomFilter {
    key: [u8; 32],
    mask: u64,
    decay_ms: u64,
    clock: Arc<dyn Clock>,
    generations: RwLock<Generations>,
    next_decay: AtomicU64,
    inserted: AtomicU64,
    duplicates: AtomicU64,
}

impl DecayingBloomFilter {
    /// Create a filter of `2^log2_bits` bits per generation.
    ///
    /// # Errors
    ///
    /// - [`ReplayError::InvalidParameters`] if `log2_bits` is outside 10..=30
    ///   or `decay_ms` is zero
    pub fn new(log2_bits: u32, decay_ms: u64, clock: Arc<dyn Clock>) -> Result<Self> {
        if !(MIN_LOG2_BITS..=MAX_LOG2_BITS).contains(&log2_bits) {
            return Err(ReplayError::InvalidParameters(format!(
                "log2 bits {log2_bits} outside {MIN_LOG2_BITS}..={MAX_LOG2_BITS}"
            )));
        }
        if decay_ms == 0 {
            return Err(ReplayError::InvalidParameters("decay period is zero".into()));
        }
        let bits = 1u64 << log2_bits;
        let words = (bits / 64) as usize;
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        let next_decay = clock.now().saturating_add(decay_ms);
        Ok(Self {
            key,
            mask: bits - 1,
            decay_ms,
            clock,
            generations: RwLock::new(Generations {
                current: zeroed(words),
                previous: zeroed(words),
            }),
            next_decay: AtomicU64::new(next_decay),
            inserted: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        })
    }

    /// Create a filter with the default size and decay period.
    pub fn with_defaults(clock: Arc<dyn Clock>) -> Result<Self> {
        Self::new(DEFAULT_LOG2_BITS, DEFAULT_DECAY_MS, clock)
    }

    /// Insert `entry`. Returns `true` if it was (probably) already present.
    pub fn add(&self, entry: &[u8]) -> bool {
        self.maybe_decay();
        let positions = self.positions(entry);
        let gens = self
            .generations
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut in_current = true;
        for pos in positions {
            let (word, bit) = split(pos);
            let before = gens.current[word].fetch_or(bit, Ordering::Relaxed);
            if before & bit == 0 {
                in_current = false;
            }
        }
        let known = in_current || all_set(&gens.previous, &positions);
        if known {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inserted.fetch_add(1, Ordering::Relaxed);
        }
        known
    }

    /// Check for `entry` without inserting it.
    pub fn is_known(&self, entry: &[u8]) -> bool {
        self.maybe_decay();
        let positions = self.positions(entry);
        let gens = self
            .generations
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        all_set(&gens.current, &positions) || all_set(&gens.previous, &positions)
    }

    /// Forget everything.
    pub fn clear(&self) {
        let gens = self
            .generations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        clear_words(&gens.current);
        clear_words(&gens.previous);
    }

    /// Entries inserted as new since creation.
    pub fn inserted(&self) -> u64 {
        self.inserted.load(Ordering::Relaxed)
    }

    /// Entries rejected as already present since creation.
    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    fn maybe_decay(&self) {
        let now = self.clock.now();
        if now < self.next_decay.load(Ordering::Acquire) {
            return;
        }
        let mut gens = self
            .generations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Another thread may have decayed while we waited for the lock.
        let due = self.next_decay.load(Ordering::Acquire);
        if now < due {
            return;
        }
        let g = &mut *gens;
        std::mem::swap(&mut g.current, &mut g.previous);
        clear_words(&g.current);
        // A gap longer than two periods leaves nothing worth remembering.
        if now >= due.saturating_add(self.decay_ms) {
            clear_words(&g.previous);
        }
        self.next_decay
            .store(now.saturating_add(self.decay_ms), Ordering::Release);
        debug!(
            inserted = self.inserted(),
            duplicates = self.duplicates(),
            "replay filter decayed"
        );
    }

    fn positions(&self, entry: &[u8]) -> [u64; NUM_HASH_FNS] {
        let mut out = [0u8; NUM_HASH_FNS * 4];
        hopnet_crypto::blake3::keyed_xof(&self.key, entry, &mut out);
        let mut positions = [0u64; NUM_HASH_FNS];
        for (pos, chunk) in positions.iter_mut().zip(out.chunks_exact(4)) {
            let val = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as u64;
            *pos = val & self.mask;
        }
        positions
    }
}

fn zeroed(words: usize) -> Box<[AtomicU64]> {
    (0..words).map(|_| AtomicU64::new(0)).collect()
}

fn clear_words(words: &[AtomicU64]) {
    for w in words {
        w.store(0, Ordering::Relaxed);
    }
}

fn split(pos: u64) -> (usize, u64) {
    ((pos / 64) as usize, 1u64 << (pos % 64))
}

fn all_set(words: &[AtomicU64], positions: &[u64; NUM_HASH_FNS]) -> bool {
    positions.iter().all(|&pos| {
        let (word, bit) = split(pos);
        words[word].load(Ordering::Relaxed) & bit != 0
    })
}
