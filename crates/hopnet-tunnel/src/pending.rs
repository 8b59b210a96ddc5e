//! Messages waiting at a gateway.

use hopnet_types::identity::{RouterHash, TunnelId};
use hopnet_types::message::TunnelMessage;

use crate::codec::Delivery;
use crate::{Result, TunnelError, MAX_MESSAGE_SIZE};

/// A queued message and how much of it has been written into cells.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    data: Vec<u8>,
    delivery: Delivery,
    message_id: u32,
    expiration: u64,
    created: u64,
    offset: usize,
    fragment_number: u8,
    cell_ids: Vec<u32>,
}

impl PendingMessage {
    /// Queue raw bytes.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::MessageTooLarge`] if `data` cannot fit in 64 fragments
    pub fn new(
        data: Vec<u8>,
        delivery: Delivery,
        message_id: u32,
        expiration: u64,
        now: u64,
    ) -> Result<Self> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(TunnelError::MessageTooLarge(data.len()));
        }
        Ok(Self {
            data,
            delivery,
            message_id,
            expiration,
            created: now,
            offset: 0,
            fragment_number: 0,
            cell_ids: Vec::new(),
        })
    }

    /// Queue an encoded message for the given post-endpoint target.
    pub fn from_message(
        msg: &TunnelMessage,
        to_router: Option<RouterHash>,
        to_tunnel: Option<TunnelId>,
        now: u64,
    ) -> Result<Self> {
        Self::new(
            msg.to_bytes()?,
            Delivery::from_target(to_router, to_tunnel),
            msg.unique_id,
            msg.expiration,
            now,
        )
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn delivery(&self) -> Delivery {
        self.delivery
    }

    pub fn message_id(&self) -> u32 {
        self.message_id
    }

    pub fn expiration(&self) -> u64 {
        self.expiration
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expiration < now
    }

    /// When the message was queued.
    pub fn created(&self) -> u64 {
        self.created
    }

    /// Bytes already written into cells.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes not yet written.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub(crate) fn remaining_data(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    pub(crate) fn advance(&mut self, n: usize) {
        self.offset = (self.offset + n).min(self.data.len());
    }

    /// Number of the next fragment to write. 0 until the first one is out.
    pub fn fragment_number(&self) -> u8 {
        self.fragment_number
    }

    pub(crate) fn increment_fragment_number(&mut self) {
        self.fragment_number = self.fragment_number.saturating_add(1);
    }

    /// Whether every byte has been written.
    pub fn is_complete(&self) -> bool {
        self.fragment_number > 0 && self.offset >= self.data.len()
    }

    /// Give up on the rest of the message.
    pub(crate) fn abandon(&mut self) {
        self.offset = self.data.len();
        self.fragment_number = self.fragment_number.max(1);
    }

    /// Ids of the cells this message went out in.
    pub fn cell_ids(&self) -> &[u32] {
        &self.cell_ids
    }

    pub(crate) fn add_cell_id(&mut self, id: u32) {
        self.cell_ids.push(id);
    }
}
