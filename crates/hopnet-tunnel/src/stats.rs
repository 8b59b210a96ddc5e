//! Data-plane counters.
//!
//! Observability only; nothing in the data plane reads them back.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        /// Live counters for one router.
        #[derive(Debug, Default)]
        pub struct TunnelStats {
            $($(#[$doc])* pub $name: AtomicU64,)*
        }

        /// Point-in-time copy of [`TunnelStats`].
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct StatsSnapshot {
            $(pub $name: u64,)*
        }

        impl TunnelStats {
            /// Read every counter.
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    /// Cells dropped for a bad checksum or malformed records.
    corrupt_cells,
    /// Cells dropped by the IV validator.
    replayed_cells,
    /// Cells from a router other than the configured previous hop.
    invalid_previous_hop,
    /// Cells and gateway messages for tunnel ids we do not know.
    unknown_tunnel,
    /// Messages dropped because they expired.
    expired_messages,
    /// Messages dropped at a full gateway queue.
    queue_overflow,
    /// Participating messages dropped by admission control.
    admission_drops,
    /// Messages a client tunnel refused by type.
    dangerous_dropped,
    /// Cells handed to the outbound queue.
    cells_sent,
    /// Cells received for local handlers.
    cells_received,
    /// Fragments written into cells.
    fragments_sent,
    /// Padding bytes written into cells.
    padding_bytes,
    /// Messages rebuilt from fragments.
    messages_reassembled,
    /// Partial messages that expired.
    reassembly_failures,
    /// Bytes forwarded for tunnels we did not create.
    participating_bytes,
}

/// Add one to a counter.
pub fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Add `n` to a counter.
pub fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}
