//! Batching preprocessor.
//!
//! Walks the queue adding up what each message still needs (remaining
//! payload plus record instructions). Whenever the total reaches a full cell,
//! everything up to that point goes out in one cell. Leftovers smaller than a
//! cell are held until one of these holds:
//!
//! - more than `force_send_threshold` messages are queued
//! - they have been waiting `delay_ms`
//! - they fill at least `full_enough_percent` of a cell

use std::sync::Arc;

use hopnet_types::clock::Clock;
use tracing::trace;

use crate::config::BatchConfig;
use crate::pending::PendingMessage;
use crate::stats::TunnelStats;
use crate::FULL_SIZE;

use super::{augmentation_size, instructions_size, send_batch, QueuePreprocessor, Receiver, Sender};

pub struct BatchedPreprocessor {
    config: BatchConfig,
    clock: Arc<dyn Clock>,
    stats: Arc<TunnelStats>,
    pending_since: Option<u64>,
}

impl BatchedPreprocessor {
    pub fn new(config: BatchConfig, clock: Arc<dyn Clock>, stats: Arc<TunnelStats>) -> Self {
        Self {
            config,
            clock,
            stats,
            pending_since: None,
        }
    }

    /// When the oldest held message was first held back.
    pub fn pending_since(&self) -> Option<u64> {
        self.pending_since
    }

    fn flush(
        &mut self,
        pending: &mut Vec<PendingMessage>,
        end: usize,
        sender: &dyn Sender,
        receiver: &dyn Receiver,
    ) {
        send_batch(&mut pending[..=end], sender, receiver, &self.stats);
        pending.retain(|m| !m.is_complete());
        self.pending_since = None;
    }
}

impl QueuePreprocessor for BatchedPreprocessor {
    fn preprocess_queue(
        &mut self,
        pending: &mut Vec<PendingMessage>,
        sender: &dyn Sender,
        receiver: &dyn Receiver,
    ) -> bool {
        'outer: while !pending.is_empty() {
            let mut allocated = 0usize;
            for i in 0..pending.len() {
                let msg = &pending[i];
                let instructions = instructions_size(msg);
                let instructions = instructions + augmentation_size(msg, allocated, instructions);
                let wanted = msg.remaining() + instructions;
                allocated += wanted;

                if allocated >= FULL_SIZE {
                    // Only the header of message i would fit; leave it for the next cell.
                    let end = if allocated - wanted + instructions >= FULL_SIZE && i > 0 {
                        i - 1
                    } else {
                        i
                    };
                    trace!(messages = end + 1, allocated, "cell full");
                    self.flush(pending, end, sender, receiver);
                    continue 'outer;
                }
            }

            // Everything left fits in one partial cell.
            let now = self.clock.now();
            let timed_out = self
                .pending_since
                .is_some_and(|since| now.saturating_sub(since) >= self.config.delay_ms);
            if pending.len() > self.config.force_send_threshold
                || timed_out
                || allocated >= self.config.full_enough_size()
            {
                trace!(
                    messages = pending.len(),
                    allocated,
                    timed_out,
                    "flushing partial cell"
                );
                let end = pending.len() - 1;
                self.flush(pending, end, sender, receiver);
                continue;
            }

            if self.pending_since.is_none() {
                self.pending_since = Some(now);
            }
            return true;
        }
        self.pending_since = None;
        false
    }

    fn delay_amount(&self) -> u64 {
        match self.pending_since {
            Some(since) => (since + self.config.delay_ms).saturating_sub(self.clock.now()),
            None => self.config.delay_ms,
        }
    }
}
