//! Gateway of a tunnel with no hops besides ourselves.

use std::sync::{Arc, Weak};

use hopnet_types::identity::{RouterHash, TunnelId};
use hopnet_types::message::TunnelMessage;
use hopnet_types::tunnel::{HopConfig, TunnelCreatorConfig};
use tracing::{trace, warn};

use crate::context::RouterContext;
use crate::dispatcher::TunnelDispatcher;
use crate::distributor::{InboundMessageDistributor, OutboundMessageDistributor};
use crate::{Result, TunnelError};

enum Target {
    Inbound(InboundMessageDistributor),
    Outbound(OutboundMessageDistributor),
}

/// Hands messages straight to a distributor: no queue, batching or crypto.
pub struct ZeroHopGateway {
    ctx: Arc<RouterContext>,
    tunnel_id: TunnelId,
    hop: Arc<HopConfig>,
    target: Target,
}

impl ZeroHopGateway {
    /// Zero-hop inbound tunnel: messages arrive for us.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::Config`] if the tunnel has no receive tunnel id
    pub fn inbound(
        ctx: Arc<RouterContext>,
        cfg: &TunnelCreatorConfig,
        dispatcher: Weak<TunnelDispatcher>,
    ) -> Result<Self> {
        let (hop, tunnel_id) = Self::hop(cfg, HopConfig::receive_tunnel)?;
        let target = Target::Inbound(InboundMessageDistributor::new(
            ctx.clone(),
            dispatcher,
            cfg.destination(),
        ));
        Ok(Self {
            ctx,
            tunnel_id,
            hop,
            target,
        })
    }

    /// Zero-hop outbound tunnel: messages leave from us.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::Config`] if the tunnel has no send tunnel id
    pub fn outbound(
        ctx: Arc<RouterContext>,
        cfg: &TunnelCreatorConfig,
        dispatcher: Weak<TunnelDispatcher>,
    ) -> Result<Self> {
        let (hop, tunnel_id) = Self::hop(cfg, HopConfig::send_tunnel)?;
        let target = Target::Outbound(OutboundMessageDistributor::new(ctx.clone(), dispatcher));
        Ok(Self {
            ctx,
            tunnel_id,
            hop,
            target,
        })
    }

    fn hop(
        cfg: &TunnelCreatorConfig,
        id: fn(&HopConfig) -> Option<TunnelId>,
    ) -> Result<(Arc<HopConfig>, TunnelId)> {
        let hop = cfg
            .config(0)
            .ok_or_else(|| TunnelError::Config("empty tunnel".into()))?;
        let tunnel_id = id(hop).ok_or_else(|| TunnelError::Config("zero-hop tunnel has no id".into()))?;
        Ok((hop.clone(), tunnel_id))
    }
}

impl super::Gateway for ZeroHopGateway {
    fn add(&self, msg: TunnelMessage, to_router: Option<RouterHash>, to_tunnel: Option<TunnelId>) -> Result<()> {
        if msg.is_expired(self.ctx.now()) {
            warn!(tunnel = %self.tunnel_id, message_id = msg.unique_id, "dropping expired message at zero-hop gateway");
            crate::stats::incr(&self.ctx.stats().expired_messages);
            return Ok(());
        }
        trace!(tunnel = %self.tunnel_id, kind = ?msg.kind, "zero-hop delivery");
        self.hop.increment_processed_messages();
        match &self.target {
            Target::Inbound(d) => d.distribute(msg, to_router, to_tunnel),
            Target::Outbound(d) => d.distribute(msg, to_router, to_tunnel),
        }
        Ok(())
    }

    fn queued(&self) -> usize {
        0
    }

    fn tunnel_id(&self) -> TunnelId {
        self.tunnel_id
    }
}

#[cfg(test)]
mod tests {
    use hopnet_types::clock::Clock;
    use super::super::Gateway;
    use super::*;
    use crate::context::testing::{hash, router};
    use hopnet_types::message::MessageType;
    use hopnet_types::tunnel::TunnelDirection;

    #[test]
    fn test_inbound_zero_hop_delivers_locally() {
        let r = router(1);
        let cfg = TunnelCreatorConfig::generate(TunnelDirection::Inbound, hash(1), &[hash(1)], r.clock.now(), 600_000)
            .expect("tunnel")
            .with_destination([4; 32]);
        let gw = ZeroHopGateway::inbound(r.ctx.clone(), &cfg, Weak::new()).expect("gateway");
        assert_eq!(Some(gw.tunnel_id()), cfg.config(0).and_then(|h| h.receive_tunnel()));

        let msg = TunnelMessage::new(MessageType::Data, vec![1], u64::MAX);
        gw.add(msg.clone(), None, None).expect("add");
        assert_eq!(r.inbound.take(), vec![(msg, Some([4; 32]))]);
        assert_eq!(cfg.config(0).expect("hop").processed_messages(), 1);
        assert_eq!(gw.queued(), 0);
    }

    #[test]
    fn test_outbound_zero_hop_sends_to_router() {
        let r = router(1);
        let cfg = TunnelCreatorConfig::generate(TunnelDirection::Outbound, hash(1), &[hash(1)], r.clock.now(), 600_000)
            .expect("tunnel");
        let gw = ZeroHopGateway::outbound(r.ctx.clone(), &cfg, Weak::new()).expect("gateway");
        let msg = TunnelMessage::new(MessageType::Data, vec![1], u64::MAX);
        gw.add(msg.clone(), Some(hash(7)), None).expect("add");
        assert_eq!(r.outbound.take(), vec![(hash(7), msg)]);
    }

    #[test]
    fn test_expired_dropped() {
        let r = router(1);
        let cfg = TunnelCreatorConfig::generate(TunnelDirection::Outbound, hash(1), &[hash(1)], 0, 1)
            .expect("tunnel");
        let gw = ZeroHopGateway::outbound(r.ctx.clone(), &cfg, Weak::new()).expect("gateway");
        gw.add(TunnelMessage::new(MessageType::Data, vec![], 5), Some(hash(7)), None)
            .expect("add");
        assert!(r.outbound.take().is_empty());
        assert_eq!(r.ctx.stats().snapshot().expired_messages, 1);
    }
}
