//! Packing without delay.

use std::sync::Arc;

use crate::pending::PendingMessage;
use crate::stats::TunnelStats;

use super::{fits, instructions_size, send_batch, QueuePreprocessor, Receiver, Sender};

/// Packs the front of the queue into as many cells as it takes and sends
/// them all immediately.
pub struct TrivialPreprocessor {
    stats: Arc<TunnelStats>,
}

impl TrivialPreprocessor {
    pub fn new(stats: Arc<TunnelStats>) -> Self {
        Self { stats }
    }

    /// Number of leading messages whose next record starts in one cell.
    fn batch_len(pending: &[PendingMessage]) -> usize {
        let mut space = crate::FULL_SIZE;
        let mut count = 0;
        for msg in pending {
            if !fits(msg, space) {
                break;
            }
            count += 1;
            let needed = instructions_size(msg) + msg.remaining();
            if needed >= space {
                break;
            }
            space -= needed;
        }
        count.max(1)
    }
}

impl QueuePreprocessor for TrivialPreprocessor {
    fn preprocess_queue(
        &mut self,
        pending: &mut Vec<PendingMessage>,
        sender: &dyn Sender,
        receiver: &dyn Receiver,
    ) -> bool {
        while !pending.is_empty() {
            let end = Self::batch_len(pending);
            send_batch(&mut pending[..end], sender, receiver, &self.stats);
            pending.retain(|m| !m.is_complete());
        }
        false
    }

    fn delay_amount(&self) -> u64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::codec::{self, Delivery};
    use crate::FULL_SIZE;

    fn pending(len: usize, id: u32) -> PendingMessage {
        PendingMessage::new(vec![7; len], Delivery::Local, id, u64::MAX, 0).expect("pending")
    }

    #[test]
    fn test_empties_queue_without_delay() {
        let mut pre = TrivialPreprocessor::new(Arc::new(TunnelStats::default()));
        let receiver = CaptureReceiver::default();
        let mut queue = vec![pending(10, 1), pending(20, 2), pending(30, 3)];
        assert!(!pre.preprocess_queue(&mut queue, &PlainSender, &receiver));
        assert!(queue.is_empty());
        assert_eq!(receiver.count(), 1);
        assert_eq!(pre.delay_amount(), 0);
    }

    #[test]
    fn test_large_message_spans_cells() {
        let mut pre = TrivialPreprocessor::new(Arc::new(TunnelStats::default()));
        let receiver = CaptureReceiver::default();
        let mut queue = vec![pending(3 * FULL_SIZE, 1)];
        pre.preprocess_queue(&mut queue, &PlainSender, &receiver);
        assert!(queue.is_empty());
        let cells = receiver.take();
        assert_eq!(cells.len(), 4);
        for cell in &cells {
            codec::open(cell).expect("valid cell");
        }
    }

    #[test]
    fn test_packs_tail_after_fragment() {
        let mut pre = TrivialPreprocessor::new(Arc::new(TunnelStats::default()));
        let receiver = CaptureReceiver::default();
        // Second cell carries the tail of the first message and all of the second.
        let mut queue = vec![pending(1500, 1), pending(50, 2)];
        pre.preprocess_queue(&mut queue, &PlainSender, &receiver);
        assert_eq!(receiver.count(), 2);
    }
}
