//! # hopnet-replay
//!
//! Replay detection for tunnel cells.
//!
//! Every hop feeds `IV XOR first 16 body bytes` of each cell through a
//! process-wide [`IvValidator`]. The default implementation is a decaying
//! Bloom filter with two generations, so entries are remembered for between
//! one and two decay periods and memory stays fixed.
//!
//! ## Modules
//!
//! - [`bloom`] — Lock-light decaying Bloom filter over atomic words
//! - [`validator`] — The [`IvValidator`] seam and its Bloom-filter implementation
//!
//! ## Key Parameters
//!
//! | Parameter | Value |
//! |---|---|
//! | Filter size | 2^23 bits per generation (1 MiB) |
//! | Hash functions | 11 (keyed BLAKE3 XOF) |
//! | Decay period | 10 minutes |

pub mod bloom;
pub mod validator;

pub use validator::{BloomFilterIvValidator, IvValidator};

/// Error types for replay filters.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// The entry was already seen within the decay window.
    #[error("duplicate entry")]
    Duplicate,

    /// Filter parameters out of range.
    #[error("invalid filter parameters: {0}")]
    InvalidParameters(String),
}

/// Convenience result type for replay operations.
pub type Result<T> = std::result::Result<T, ReplayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(ReplayError::Duplicate.to_string(), "duplicate entry");
        let err = ReplayError::InvalidParameters("log2 bits 3".into());
        assert!(err.to_string().contains("log2 bits 3"));
    }
}
