//! Packing queued messages into cells.
//!
//! A [`QueuePreprocessor`] consumes the front of a gateway queue, writes
//! fragment records into [`CellWriter`]s, seals each cell and hands it to a
//! [`Sender`] for the gateway's crypto, which passes it on to a [`Receiver`]
//! for delivery. Completed messages are removed from the queue.
//!
//! | Variant | Policy |
//! |---|---|
//! | [`trivial::TrivialPreprocessor`] | pack whatever is queued, never wait |
//! | [`batched::BatchedPreprocessor`] | wait briefly for a cell's worth of data |

pub mod batched;
pub mod trivial;

use std::sync::Arc;

use hopnet_types::clock::Clock;
use tracing::{error, trace};

use crate::codec::{self, CellWriter, FRAGMENTED_EXTRA_SIZE, SUBSEQUENT_INSTRUCTIONS_SIZE};
use crate::config::BatchConfig;
use crate::pending::PendingMessage;
use crate::stats::{self, TunnelStats};
use crate::{Cell, Result, TunnelError, MAX_FRAGMENTS};

pub use batched::BatchedPreprocessor;
pub use trivial::TrivialPreprocessor;

/// Applies a gateway's layers to a sealed cell.
pub trait Sender: Send + Sync {
    /// Encrypt `cell` and pass it to `receiver`. Returns the id of the
    /// message it left in, if any.
    fn send_preprocessed(&self, cell: Box<Cell>, receiver: &dyn Receiver) -> Option<u32>;
}

/// Takes an encrypted cell onward.
pub trait Receiver: Send + Sync {
    /// Deliver `cell`. Returns the id of the message it left in, if any.
    fn receive_encrypted(&self, cell: Box<Cell>) -> Option<u32>;
}

/// Packing policy for one gateway queue.
pub trait QueuePreprocessor: Send {
    /// Write as much of `pending` into cells as the policy allows.
    ///
    /// Returns `true` if messages were held back and the caller should try
    /// again after [`QueuePreprocessor::delay_amount`] milliseconds.
    fn preprocess_queue(
        &mut self,
        pending: &mut Vec<PendingMessage>,
        sender: &dyn Sender,
        receiver: &dyn Receiver,
    ) -> bool;

    /// How long until held messages should be flushed.
    fn delay_amount(&self) -> u64;
}

/// Pick the preprocessor the batch configuration asks for.
pub fn for_config(
    batch: &BatchConfig,
    clock: Arc<dyn Clock>,
    stats: Arc<TunnelStats>,
) -> Box<dyn QueuePreprocessor> {
    if batch.use_batching {
        Box::new(BatchedPreprocessor::new(batch.clone(), clock, stats))
    } else {
        Box::new(TrivialPreprocessor::new(stats))
    }
}

/// Instruction bytes for the next record of `msg`, without the message id a
/// fragmented first record adds.
pub(crate) fn instructions_size(msg: &PendingMessage) -> usize {
    if msg.fragment_number() == 0 {
        codec::first_instructions_size(&msg.delivery(), false)
    } else {
        SUBSEQUENT_INSTRUCTIONS_SIZE
    }
}

/// Extra instruction bytes if the first record of `msg` will not fit after
/// `allocated` bytes.
pub(crate) fn augmentation_size(msg: &PendingMessage, allocated: usize, instructions: usize) -> usize {
    if msg.fragment_number() == 0 && msg.remaining() + instructions + allocated > crate::FULL_SIZE {
        FRAGMENTED_EXTRA_SIZE
    } else {
        0
    }
}

/// Whether at least the next record header and one payload byte (or the
/// whole remainder) of `msg` fit in `space` bytes.
pub(crate) fn fits(msg: &PendingMessage, space: usize) -> bool {
    let instructions = instructions_size(msg);
    if instructions + msg.remaining() <= space {
        return true;
    }
    let instructions = if msg.fragment_number() == 0 {
        instructions + FRAGMENTED_EXTRA_SIZE
    } else {
        instructions
    };
    instructions < space
}

/// Write the next record of `msg` into `writer`.
pub(crate) fn write_fragment(writer: &mut CellWriter, msg: &mut PendingMessage) -> Result<()> {
    if msg.fragment_number() == 0 {
        write_first_fragment(writer, msg)
    } else {
        write_subsequent_fragment(writer, msg)
    }
}

fn write_first_fragment(writer: &mut CellWriter, msg: &mut PendingMessage) -> Result<()> {
    let delivery = msg.delivery();
    let remaining = msg.remaining();
    let instructions = codec::first_instructions_size(&delivery, false);

    if instructions + remaining <= writer.remaining() {
        writer.write_first(&delivery, None, msg.remaining_data())?;
        msg.advance(remaining);
    } else {
        let instructions = instructions + FRAGMENTED_EXTRA_SIZE;
        let space = writer.remaining().saturating_sub(instructions);
        if space == 0 {
            return Err(TunnelError::Internal(format!(
                "no room for the first fragment of message {}",
                msg.message_id()
            )));
        }
        writer.write_first(&delivery, Some(msg.message_id()), &msg.remaining_data()[..space])?;
        msg.advance(space);
    }
    msg.increment_fragment_number();
    Ok(())
}

fn write_subsequent_fragment(writer: &mut CellWriter, msg: &mut PendingMessage) -> Result<()> {
    let number = msg.fragment_number();
    if usize::from(number) >= MAX_FRAGMENTS {
        return Err(TunnelError::MessageTooLarge(msg.data().len()));
    }
    let remaining = msg.remaining();
    let space = writer.remaining().saturating_sub(SUBSEQUENT_INSTRUCTIONS_SIZE);
    let len = remaining.min(space);
    if len == 0 {
        return Err(TunnelError::Internal(format!(
            "no room for fragment {number} of message {}",
            msg.message_id()
        )));
    }
    let is_last = len == remaining;
    writer.write_follow(msg.message_id(), number, is_last, &msg.remaining_data()[..len])?;
    msg.advance(len);
    msg.increment_fragment_number();
    Ok(())
}

/// Write the next record of every message in `batch` into one cell, seal it
/// and send it. A message whose record cannot be written is abandoned.
pub(crate) fn send_batch(
    batch: &mut [PendingMessage],
    sender: &dyn Sender,
    receiver: &dyn Receiver,
    stats: &TunnelStats,
) {
    let mut writer = CellWriter::new();
    let mut fragments = 0u64;
    for msg in batch.iter_mut() {
        match write_fragment(&mut writer, msg) {
            Ok(()) => fragments += 1,
            Err(e) => {
                error!(message_id = msg.message_id(), error = %e, "abandoning message");
                msg.abandon();
            }
        }
    }
    let (cell, padding) = writer.seal();
    stats::add(&stats.fragments_sent, fragments);
    stats::add(&stats.padding_bytes, padding as u64);
    trace!(fragments, padding, "sending preprocessed cell");

    if let Some(id) = sender.send_preprocessed(cell, receiver) {
        for msg in batch.iter_mut() {
            msg.add_cell_id(id);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::codec::{Delivery, Fragment};
    use crate::FULL_SIZE;
    use hopnet_types::identity::RouterHash;

    fn pending(len: usize, id: u32) -> PendingMessage {
        PendingMessage::new(vec![id as u8; len], Delivery::Local, id, u64::MAX, 0).expect("pending")
    }

    #[test]
    fn test_augmentation_only_for_unstarted_overflow() {
        let small = pending(10, 1);
        assert_eq!(augmentation_size(&small, 0, 3), 0);
        let big = pending(FULL_SIZE, 2);
        assert_eq!(augmentation_size(&big, 0, 3), FRAGMENTED_EXTRA_SIZE);

        let mut started = pending(FULL_SIZE * 2, 3);
        started.increment_fragment_number();
        assert_eq!(augmentation_size(&started, 0, SUBSEQUENT_INSTRUCTIONS_SIZE), 0);
    }

    #[test]
    fn test_instructions_size_by_delivery() {
        let router = PendingMessage::new(
            vec![],
            Delivery::Router(RouterHash::from_bytes([1; 32])),
            1,
            0,
            0,
        )
        .expect("pending");
        assert_eq!(instructions_size(&router), 35);
        let mut started = pending(10, 1);
        started.increment_fragment_number();
        assert_eq!(instructions_size(&started), SUBSEQUENT_INSTRUCTIONS_SIZE);
    }

    #[test]
    fn test_fits() {
        let msg = pending(100, 1);
        assert!(fits(&msg, 103));
        assert!(fits(&msg, 8));
        assert!(!fits(&msg, 7));
    }

    #[test]
    fn test_write_first_fragment_splits() {
        let mut writer = CellWriter::new();
        let mut msg = pending(2000, 7);
        write_fragment(&mut writer, &mut msg).expect("write");
        assert_eq!(writer.remaining(), 0);
        assert_eq!(msg.offset(), FULL_SIZE - 7);
        assert_eq!(msg.fragment_number(), 1);

        let mut writer = CellWriter::new();
        write_fragment(&mut writer, &mut msg).expect("write");
        assert_eq!(msg.offset(), 2 * FULL_SIZE - 14);
        assert_eq!(msg.fragment_number(), 2);
    }

    #[test]
    fn test_send_batch_marks_cells() {
        let receiver = CaptureReceiver::default();
        let stats = TunnelStats::default();
        let mut batch = vec![pending(10, 1), pending(20, 2)];
        send_batch(&mut batch, &PlainSender, &receiver, &stats);

        assert!(batch.iter().all(|m| m.is_complete()));
        assert_eq!(batch[0].cell_ids(), &[1]);
        assert_eq!(stats.snapshot().fragments_sent, 2);

        let cells = receiver.take();
        let records = codec::open(&cells[0]).expect("open");
        let frags: Vec<_> = codec::records(records)
            .collect::<Result<Vec<_>>>()
            .expect("records");
        assert!(matches!(frags[1], Fragment::First { payload, .. } if payload.len() == 20));
    }

    #[test]
    fn test_fragment_limit() {
        let mut writer = CellWriter::new();
        let mut msg = pending(10, 1);
        for _ in 0..MAX_FRAGMENTS {
            msg.increment_fragment_number();
        }
        assert!(matches!(
            write_fragment(&mut writer, &mut msg),
            Err(TunnelError::MessageTooLarge(_))
        ));
    }
}
