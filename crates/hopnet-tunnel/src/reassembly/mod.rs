//! Fragment reassembly at tunnel endpoints.
//!
//! [`FragmentHandler::receive_cell`] takes a decrypted cell, verifies its
//! checksum and walks the records. Unfragmented messages are delivered at
//! once; fragments are collected per message id in a [`FragmentedMessage`]
//! until fragment 0 through the last are all present.
//!
//! An incomplete message arms one expiry timer. If the timer fires first the
//! partial message is dropped and counted as failed. Completed messages are
//! handed to the [`DefragmentedReceiver`] after the handler's lock is
//! released.

mod message;

pub use message::FragmentedMessage;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use hopnet_types::identity::{RouterHash, TunnelId};
use tracing::{debug, trace, warn};

use crate::codec::{self, Delivery, Fragment};
use crate::context::{ProfileEvent, RouterContext};
use crate::stats;
use crate::{Cell, Result, TunnelError};

/// Consumer of reassembled messages.
pub trait DefragmentedReceiver: Send + Sync {
    /// `data` is an encoded message; the target comes from its delivery
    /// instructions.
    fn receive_complete(&self, data: Vec<u8>, to_router: Option<RouterHash>, to_tunnel: Option<TunnelId>);
}

/// Reassembles the messages of one tunnel endpoint.
pub struct FragmentHandler {
    this: Weak<FragmentHandler>,
    ctx: Arc<RouterContext>,
    receiver: Arc<dyn DefragmentedReceiver>,
    fragmented: Mutex<HashMap<u32, FragmentedMessage>>,
    next_serial: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl FragmentHandler {
    pub fn new(ctx: Arc<RouterContext>, receiver: Arc<dyn DefragmentedReceiver>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            ctx,
            receiver,
            fragmented: Mutex::new(HashMap::new()),
            next_serial: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    /// Reassemble from one decrypted cell.
    ///
    /// Messages completed by records before a malformed one are still
    /// delivered.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::Corrupt`] on a checksum failure or malformed record
    /// - [`TunnelError::MessageTooLarge`] if a message outgrows the fragment limit
    pub fn receive_cell(&self, cell: &Cell) -> Result<()> {
        let mut ready = Vec::new();
        let result = self.process_cell(cell, &mut ready);
        for (data, delivery) in ready {
            self.deliver(data, delivery);
        }
        if let Err(e) = &result {
            if matches!(e, TunnelError::Corrupt(_)) {
                stats::incr(&self.ctx.stats().corrupt_cells);
            }
            debug!(error = %e, "cell rejected by reassembly");
        }
        result
    }

    /// Partial messages waiting for fragments.
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    /// Messages delivered so far.
    pub fn completed_count(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Partial messages dropped so far.
    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    fn process_cell(&self, cell: &Cell, ready: &mut Vec<(Vec<u8>, Delivery)>) -> Result<()> {
        let records = codec::open(cell)?;
        for record in codec::records(records) {
            match record? {
                Fragment::First {
                    delivery,
                    message_id: None,
                    payload,
                } => ready.push((payload.to_vec(), delivery)),
                Fragment::First {
                    delivery,
                    message_id: Some(id),
                    payload,
                } => self.insert(id, ready, |msg| msg.receive_first(delivery, payload))?,
                Fragment::Follow {
                    message_id,
                    number,
                    is_last,
                    payload,
                } => self.insert(message_id, ready, |msg| msg.receive(number, payload, is_last))?,
            }
        }
        Ok(())
    }

    fn insert<F>(&self, id: u32, ready: &mut Vec<(Vec<u8>, Delivery)>, store: F) -> Result<()>
    where
        F: FnOnce(&mut FragmentedMessage) -> Result<()>,
    {
        let mut map = self.lock();
        let is_new = !map.contains_key(&id);
        let msg = map.entry(id).or_insert_with(|| {
            let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
            FragmentedMessage::new(id, serial, self.ctx.now())
        });

        if let Err(e) = store(msg) {
            let abandon = is_new || matches!(e, TunnelError::MessageTooLarge(_));
            if abandon {
                if let Some(msg) = map.remove(&id) {
                    if let Some(handle) = msg.expire_handle() {
                        self.ctx.timer().cancel(handle);
                    }
                    if !is_new {
                        self.count_failure(&msg);
                    }
                }
            }
            return Err(e);
        }

        if msg.is_complete() {
            if let Some(msg) = map.remove(&id) {
                if let Some(handle) = msg.expire_handle() {
                    self.ctx.timer().cancel(handle);
                }
                trace!(message_id = id, fragments = msg.fragment_count(), "message reassembled");
                ready.push(msg.assemble());
            }
        } else if msg.expire_handle().is_none() {
            let handler = self.this.clone();
            let serial = msg.serial();
            let handle = self
                .ctx
                .timer()
                .schedule(self.ctx.config().max_defragment_time_ms, move || {
                    if let Some(handler) = handler.upgrade() {
                        handler.expire(id, serial);
                    }
                });
            msg.set_expire_handle(handle);
        }
        Ok(())
    }

    fn expire(&self, id: u32, serial: u64) {
        let removed = {
            let mut map = self.lock();
            match map.get(&id) {
                Some(msg) if msg.serial() == serial => map.remove(&id),
                _ => None,
            }
        };
        if let Some(msg) = removed {
            warn!(
                message_id = id,
                fragments = msg.fragment_count(),
                age_ms = self.ctx.now().saturating_sub(msg.created()),
                "partial message expired"
            );
            self.count_failure(&msg);
        }
    }

    fn count_failure(&self, msg: &FragmentedMessage) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        stats::incr(&self.ctx.stats().reassembly_failures);
        self.ctx.profiles().record(ProfileEvent::FragmentsLost {
            fragments: msg.fragment_count(),
        });
    }

    fn deliver(&self, data: Vec<u8>, delivery: Delivery) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        stats::incr(&self.ctx.stats().messages_reassembled);
        self.receiver
            .receive_complete(data, delivery.router(), delivery.tunnel());
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, FragmentedMessage>> {
        self.fragmented
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
