//! # hopnet-tunnel
//!
//! The tunnel data plane: framing, per-hop layering, batching, reassembly,
//! and the routing table that ties the roles together.
//!
//! Sending: [`gateway::Gateway::add`] → [`preprocessor`] packs messages into
//! cells → [`hop::HopTransform`] adds or pre-removes layers → the cell goes to
//! the next hop through the router's outbound queue.
//!
//! Receiving: [`dispatcher::TunnelDispatcher::receive`] routes a cell by tunnel
//! id → [`participant::TunnelParticipant`] or [`endpoint::OutboundTunnelEndpoint`]
//! applies its layer → [`reassembly::FragmentHandler`] rebuilds messages →
//! [`distributor`] delivers them.
//!
//! ## Modules
//!
//! | Module | Role |
//! |---|---|
//! | [`codec`] | Cell envelope and fragment record encoding |
//! | [`pending`] | Messages queued at a gateway, with their send cursor |
//! | [`preprocessor`] | Trivial and batched packing of queued messages into cells |
//! | [`hop`] | Per-hop AES layer transform with replay and previous-hop checks |
//! | [`reassembly`] | Fragment reassembly with expiry |
//! | [`gateway`] | Gateways: synchronous, pumped, throttled, zero-hop; the pump pool |
//! | [`participant`] | Middle hops and our inbound endpoints |
//! | [`endpoint`] | Outbound endpoints of tunnels we do not own |
//! | [`distributor`] | Final delivery of reassembled messages |
//! | [`throttle`] | Share-bandwidth admission control |
//! | [`dispatcher`] | Tunnel id routing table and participation lifecycle |
//! | [`timer`] | Shared timer for delayed flushes and expiry |
//! | [`context`] | Per-router collaborators passed to every component |
//!
//! ## Key Parameters
//!
//! | Parameter | Value |
//! |---|---|
//! | Cell size | 1024 bytes |
//! | Usable record space per cell | 1003 bytes |
//! | Fragments per message | 64 |
//! | Reassembly timeout | 60 seconds |
//! | Pump threads | 4 |

pub mod codec;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod distributor;
pub mod endpoint;
pub mod gateway;
pub mod hop;
pub mod participant;
pub mod pending;
pub mod preprocessor;
pub mod reassembly;
pub mod stats;
pub mod throttle;
pub mod timer;

pub use hopnet_types::CELL_SIZE;

/// One tunnel cell.
pub type Cell = [u8; CELL_SIZE];

/// Size of the IV at the front of each cell.
pub const IV_SIZE: usize = 16;

/// Size of the truncated SHA-256 checksum following the IV.
pub const CHECKSUM_SIZE: usize = 4;

/// Bytes available for fragment records: cell minus IV, checksum and the
/// zero terminator.
pub const FULL_SIZE: usize = CELL_SIZE - IV_SIZE - 1 - CHECKSUM_SIZE;

/// Fragment numbers are 6 bits wide.
pub const MAX_FRAGMENTS: usize = 64;

/// Largest message a gateway accepts (61 KiB), small enough to always fit in
/// [`MAX_FRAGMENTS`] fragments wherever the first one starts.
pub const MAX_MESSAGE_SIZE: usize = 61 * 1024;

/// Default time a partial message may wait for its remaining fragments.
pub const MAX_DEFRAGMENT_TIME_MS: u64 = 60_000;

/// Error types for the tunnel data plane.
///
/// None of these reach the sender of a cell; handlers count them and drop.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Bad checksum, malformed record, or out-of-bounds length.
    #[error("corrupt cell: {0}")]
    Corrupt(String),

    /// The cell's IV was seen recently.
    #[error("replayed IV")]
    Replay,

    /// The cell arrived from a router other than the configured previous hop.
    #[error("invalid previous hop: expected {expected}, got {actual}")]
    InvalidPreviousHop {
        expected: hopnet_types::identity::RouterHash,
        actual: hopnet_types::identity::RouterHash,
    },

    /// A gateway queue is at capacity.
    #[error("gateway queue full ({0} messages)")]
    QueueFull(usize),

    /// Message exceeds what the fragment format can carry.
    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    /// Message expired before it could be handled.
    #[error("message expired {0} ms ago")]
    Expired(u64),

    /// No local handler for the tunnel id.
    #[error("unknown tunnel {0}")]
    UnknownTunnel(hopnet_types::identity::TunnelId),

    /// A component was asked to do something its role cannot.
    #[error("internal error: {0}")]
    Internal(String),

    /// Missing or inconsistent configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Error from hopnet-crypto.
    #[error("crypto error: {0}")]
    Crypto(#[from] hopnet_crypto::CryptoError),

    /// Error from hopnet-types.
    #[error("decode error: {0}")]
    Types(#[from] hopnet_types::TypesError),

    /// Error from hopnet-replay.
    #[error("replay filter error: {0}")]
    ReplayFilter(#[from] hopnet_replay::ReplayError),

    /// Thread spawn failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type for tunnel operations.
pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(CELL_SIZE, 1024);
        assert_eq!(FULL_SIZE, 1003);
        assert_eq!(MAX_FRAGMENTS, 64);
    }

    #[test]
    fn test_max_message_fits_in_fragments() {
        // Worst case: the first fragment carries one byte, every other one
        // fills a cell after its 7-byte header.
        let worst = 1 + (MAX_FRAGMENTS - 1) * (FULL_SIZE - 7);
        assert!(MAX_MESSAGE_SIZE <= worst);
    }

    #[test]
    fn test_error_display() {
        let err = TunnelError::QueueFull(2048);
        assert!(err.to_string().contains("2048"));
        let err = TunnelError::Corrupt("bad checksum".into());
        assert_eq!(err.to_string(), "corrupt cell: bad checksum");
    }
}
