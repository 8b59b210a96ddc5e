//! Tunnel gateways.
//!
//! A gateway queues messages for one tunnel, runs them through its
//! [`QueuePreprocessor`], and hands sealed cells to its [`Sender`] for the
//! gateway crypto, which passes them to a [`Receiver`] for delivery to the
//! next hop.
//!
//! | Type | Flush runs on |
//! |---|---|
//! | [`TunnelGateway`] | the caller's thread |
//! | [`PumpedTunnelGateway`] | a [`TunnelGatewayPumper`] worker; optionally throttled |
//! | [`ZeroHopGateway`] | nothing to flush, delivers directly |
//!
//! When the preprocessor holds messages back, one delayed flush is scheduled
//! on the router timer. Expired messages are dropped after every flush while
//! the queue lock is still held.

mod pumped;
mod pumper;
mod sender;
mod zero_hop;

pub use pumped::{PumpedTunnelGateway, MAX_MESSAGES_PER_PUMP};
pub use pumper::TunnelGatewayPumper;
pub use sender::{GatewaySender, NextHopReceiver};
pub use zero_hop::ZeroHopGateway;

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use hopnet_types::identity::{RouterHash, TunnelId};
use hopnet_types::message::TunnelMessage;
use tracing::{debug, trace, warn};

use crate::context::RouterContext;
use crate::pending::PendingMessage;
use crate::preprocessor::{self, QueuePreprocessor, Receiver, Sender};
use crate::stats;
use crate::timer::TimerHandle;
use crate::Result;

/// Entry point of a tunnel.
pub trait Gateway: Send + Sync {
    /// Queue `msg` for the tunnel. After the endpoint it goes to `to_router`
    /// (and `to_tunnel` there), or stays at the endpoint if both are `None`.
    ///
    /// # Errors
    ///
    /// - [`crate::TunnelError::MessageTooLarge`] if `msg` exceeds the fragment limit
    fn add(&self, msg: TunnelMessage, to_router: Option<RouterHash>, to_tunnel: Option<TunnelId>) -> Result<()>;

    /// Messages waiting to be written into cells.
    fn queued(&self) -> usize;

    /// Tunnel id this gateway is registered under.
    fn tunnel_id(&self) -> TunnelId;
}

struct GatewayQueue {
    queue: Vec<PendingMessage>,
    preprocessor: Box<dyn QueuePreprocessor>,
    last_flush: u64,
    delayed_flush: Option<TimerHandle>,
}

/// Queue, preprocessor and crypto shared by the gateway variants.
pub(crate) struct GatewayCore {
    ctx: Arc<RouterContext>,
    tunnel_id: TunnelId,
    state: Mutex<GatewayQueue>,
    sender: Box<dyn Sender>,
    receiver: Box<dyn Receiver>,
}

impl GatewayCore {
    pub(crate) fn new(
        ctx: Arc<RouterContext>,
        tunnel_id: TunnelId,
        sender: Box<dyn Sender>,
        receiver: Box<dyn Receiver>,
    ) -> Self {
        let preprocessor = preprocessor::for_config(
            &ctx.config().batch,
            ctx.clock().clone(),
            ctx.stats().clone(),
        );
        Self {
            state: Mutex::new(GatewayQueue {
                queue: Vec::new(),
                preprocessor,
                last_flush: ctx.now(),
                delayed_flush: None,
            }),
            ctx,
            tunnel_id,
            sender,
            receiver,
        }
    }

    pub(crate) fn ctx(&self) -> &Arc<RouterContext> {
        &self.ctx
    }

    pub(crate) fn tunnel_id(&self) -> TunnelId {
        self.tunnel_id
    }

    pub(crate) fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    /// When the queue was last preprocessed.
    pub(crate) fn last_flush(&self) -> u64 {
        self.lock().last_flush
    }

    /// Append `incoming`, preprocess, and drop what has expired.
    ///
    /// `schedule` is called with a delay when the preprocessor holds messages
    /// back and no delayed flush is pending yet.
    pub(crate) fn flush<I>(&self, incoming: I, schedule: &dyn Fn(u64) -> TimerHandle)
    where
        I: IntoIterator<Item = PendingMessage>,
    {
        let limit = self.ctx.config().gateway_queue_limit;
        let mut guard = self.lock();
        let state = &mut *guard;

        for msg in incoming {
            if state.queue.len() >= limit {
                stats::incr(&self.ctx.stats().queue_overflow);
                debug!(tunnel = %self.tunnel_id, limit, "gateway queue full, dropping message");
                continue;
            }
            state.queue.push(msg);
        }

        let delay_needed = state.preprocessor.preprocess_queue(
            &mut state.queue,
            self.sender.as_ref(),
            self.receiver.as_ref(),
        );
        let now = self.ctx.now();
        state.last_flush = now;

        if delay_needed {
            if state.delayed_flush.is_none() {
                let delay = state.preprocessor.delay_amount();
                trace!(tunnel = %self.tunnel_id, delay, queued = state.queue.len(), "delaying flush");
                state.delayed_flush = Some(schedule(delay));
            }
        } else if let Some(handle) = state.delayed_flush.take() {
            self.ctx.timer().cancel(handle);
        }

        let before = state.queue.len();
        state.queue.retain(|msg| {
            if msg.is_expired(now) {
                warn!(
                    tunnel = %self.tunnel_id,
                    message_id = msg.message_id(),
                    sent = msg.offset(),
                    size = msg.data().len(),
                    "dropping expired message from gateway queue"
                );
                false
            } else {
                true
            }
        });
        let expired = before - state.queue.len();
        if expired > 0 {
            stats::add(&self.ctx.stats().expired_messages, expired as u64);
            if state.queue.is_empty() {
                if let Some(handle) = state.delayed_flush.take() {
                    self.ctx.timer().cancel(handle);
                }
            }
        }
    }

    /// Forget the pending delayed flush; called when it fires.
    pub(crate) fn clear_delayed(&self) {
        self.lock().delayed_flush = None;
    }

    fn lock(&self) -> MutexGuard<'_, GatewayQueue> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Gateway that preprocesses on the thread calling [`Gateway::add`].
pub struct TunnelGateway {
    this: Weak<TunnelGateway>,
    core: GatewayCore,
}

impl TunnelGateway {
    pub fn new(
        ctx: Arc<RouterContext>,
        tunnel_id: TunnelId,
        sender: Box<dyn Sender>,
        receiver: Box<dyn Receiver>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            core: GatewayCore::new(ctx, tunnel_id, sender, receiver),
        })
    }

    /// When the queue was last preprocessed.
    pub fn last_flush(&self) -> u64 {
        self.core.last_flush()
    }

    fn flush(&self, incoming: Option<PendingMessage>) {
        let this = self.this.clone();
        let timer = self.core.ctx().timer().clone();
        self.core.flush(incoming, &|delay| {
            let this = this.clone();
            timer.schedule(delay, move || {
                if let Some(gateway) = this.upgrade() {
                    gateway.core.clear_delayed();
                    gateway.flush(None);
                }
            })
        });
    }
}

impl Gateway for TunnelGateway {
    fn add(&self, msg: TunnelMessage, to_router: Option<RouterHash>, to_tunnel: Option<TunnelId>) -> Result<()> {
        let pending = PendingMessage::from_message(&msg, to_router, to_tunnel, self.core.ctx().now())?;
        self.flush(Some(pending));
        Ok(())
    }

    fn queued(&self) -> usize {
        self.core.queued()
    }

    fn tunnel_id(&self) -> TunnelId {
        self.core.tunnel_id()
    }
}
