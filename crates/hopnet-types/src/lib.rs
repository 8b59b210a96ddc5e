//! # hopnet-types
//!
//! Shared domain types for the hopnet tunnel data plane.
//!
//! - [`identity`] — Router hashes and tunnel identifiers
//! - [`tunnel`] — Per-hop state ([`tunnel::HopConfig`]) and the creator's view of a tunnel
//! - [`message`] — The I2NP-style message envelope and the two tunnel message types
//! - [`clock`] — Millisecond clock abstraction with a manual clock for tests

pub mod clock;
pub mod identity;
pub mod message;
pub mod tunnel;

/// Common type aliases.
pub type Hash = [u8; 32];
pub type Bytes = Vec<u8>;

/// Size of one tunnel cell on the wire: 16-byte IV + 1008 encrypted bytes.
pub const CELL_SIZE: usize = 1024;

/// Tolerated clock skew between routers, in milliseconds.
pub const CLOCK_FUDGE_MS: u64 = 60_000;

/// Error types for decoding and constructing shared types.
#[derive(Debug, thiserror::Error)]
pub enum TypesError {
    /// Input ended before a field could be read.
    #[error("truncated input: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// Tunnel ids are positive 32-bit values.
    #[error("invalid tunnel id: {0}")]
    InvalidTunnelId(u32),

    /// The header checksum does not match the payload.
    #[error("message checksum mismatch")]
    ChecksumMismatch,

    /// Declared size does not match the bytes present.
    #[error("size mismatch: declared {declared}, actual {actual}")]
    SizeMismatch { declared: usize, actual: usize },

    /// A message was decoded as the wrong type.
    #[error("wrong message type: expected {expected}, got {actual}")]
    WrongMessageType { expected: u8, actual: u8 },

    /// Payload exceeds what the envelope can describe.
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// A tunnel must have at least one hop.
    #[error("tunnel has no hops")]
    EmptyTunnel,

    /// Hop and peer lists disagree.
    #[error("invalid tunnel configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, TypesError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(CELL_SIZE, 1024);
        assert_eq!(CLOCK_FUDGE_MS, 60_000);
    }

    #[test]
    fn test_error_display() {
        let err = TypesError::Truncated {
            needed: 16,
            available: 3,
        };
        assert!(err.to_string().contains("need 16"));
        assert!(err.to_string().contains("have 3"));
    }
}
