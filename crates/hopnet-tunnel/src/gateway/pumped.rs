//! Gateway flushed by the pump pool.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use hopnet_types::identity::{RouterHash, TunnelId};
use hopnet_types::message::TunnelMessage;
use hopnet_types::tunnel::HopConfig;
use tracing::trace;

use crate::context::RouterContext;
use crate::pending::PendingMessage;
use crate::preprocessor::{Receiver, Sender};
use crate::throttle::{Location, ParticipatingThrottle};
use crate::{Result, CELL_SIZE};

use super::{Gateway, GatewayCore, TunnelGatewayPumper};

/// Most messages moved from the pre-queue in one pump.
pub const MAX_MESSAGES_PER_PUMP: usize = 64;

/// Smallest size charged against the participating budget per message.
const MIN_THROTTLE_SIZE: usize = 512;

/// Gateway whose `add` only enqueues; a pump worker does the preprocessing.
///
/// A throttled instance (a foreign inbound gateway) runs admission control
/// before queuing anything.
pub struct PumpedTunnelGateway {
    this: Weak<PumpedTunnelGateway>,
    core: GatewayCore,
    prequeue: Mutex<VecDeque<PendingMessage>>,
    pumper: Arc<TunnelGatewayPumper>,
    throttle: Option<(Arc<ParticipatingThrottle>, Arc<HopConfig>)>,
    queued_for_pump: AtomicBool,
}

impl PumpedTunnelGateway {
    pub fn new(
        ctx: Arc<RouterContext>,
        tunnel_id: TunnelId,
        sender: Box<dyn Sender>,
        receiver: Box<dyn Receiver>,
        pumper: Arc<TunnelGatewayPumper>,
    ) -> Arc<Self> {
        Self::build(ctx, tunnel_id, sender, receiver, pumper, None)
    }

    /// A gateway that drops messages when participating traffic is over
    /// budget, charging drops to `hop`.
    pub fn throttled(
        ctx: Arc<RouterContext>,
        tunnel_id: TunnelId,
        sender: Box<dyn Sender>,
        receiver: Box<dyn Receiver>,
        pumper: Arc<TunnelGatewayPumper>,
        throttle: Arc<ParticipatingThrottle>,
        hop: Arc<HopConfig>,
    ) -> Arc<Self> {
        Self::build(ctx, tunnel_id, sender, receiver, pumper, Some((throttle, hop)))
    }

    fn build(
        ctx: Arc<RouterContext>,
        tunnel_id: TunnelId,
        sender: Box<dyn Sender>,
        receiver: Box<dyn Receiver>,
        pumper: Arc<TunnelGatewayPumper>,
        throttle: Option<(Arc<ParticipatingThrottle>, Arc<HopConfig>)>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            core: GatewayCore::new(ctx, tunnel_id, sender, receiver),
            prequeue: Mutex::new(VecDeque::new()),
            pumper,
            throttle,
            queued_for_pump: AtomicBool::new(false),
        })
    }

    /// Mark as waiting for a pump. Returns `false` if it already was.
    pub(crate) fn mark_queued(&self) -> bool {
        !self.queued_for_pump.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn clear_queued(&self) {
        self.queued_for_pump.store(false, Ordering::Release);
    }

    /// Move up to [`MAX_MESSAGES_PER_PUMP`] messages into the gateway queue
    /// and flush. Returns `true` if the pre-queue still holds messages.
    pub(crate) fn pump(&self) -> bool {
        let batch: Vec<PendingMessage> = {
            let mut prequeue = self.prequeue();
            let n = prequeue.len().min(MAX_MESSAGES_PER_PUMP);
            prequeue.drain(..n).collect()
        };
        trace!(tunnel = %self.core.tunnel_id(), messages = batch.len(), "pumping gateway");

        let this = self.this.clone();
        let timer = self.core.ctx().timer().clone();
        self.core.flush(batch, &|delay| {
            let this = this.clone();
            timer.schedule(delay, move || {
                if let Some(gateway) = this.upgrade() {
                    gateway.core.clear_delayed();
                    gateway.pumper.want_pumping(gateway.clone());
                }
            })
        });
        !self.prequeue().is_empty()
    }

    fn prequeue(&self) -> MutexGuard<'_, VecDeque<PendingMessage>> {
        self.prequeue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns `true` if admission control dropped `msg`.
    fn throttle_drop(&self, msg: &TunnelMessage) -> bool {
        let Some((throttle, hop)) = &self.throttle else {
            return false;
        };
        let size = msg.size().max(MIN_THROTTLE_SIZE);
        if !throttle.should_drop(Location::InboundGateway, msg.kind, size) {
            return false;
        }
        // Charge the dropped cells to the hop as if forwarded.
        for _ in 0..size.div_ceil(CELL_SIZE) {
            hop.increment_processed_messages();
        }
        true
    }
}

impl Gateway for PumpedTunnelGateway {
    fn add(&self, msg: TunnelMessage, to_router: Option<RouterHash>, to_tunnel: Option<TunnelId>) -> Result<()> {
        if self.throttle_drop(&msg) {
            return Ok(());
        }
        let pending = PendingMessage::from_message(&msg, to_router, to_tunnel, self.core.ctx().now())?;
        self.prequeue().push_back(pending);
        if let Some(this) = self.this.upgrade() {
            self.pumper.want_pumping(this);
        }
        Ok(())
    }

    fn queued(&self) -> usize {
        self.prequeue().len() + self.core.queued()
    }

    fn tunnel_id(&self) -> TunnelId {
        self.core.tunnel_id()
    }
}
