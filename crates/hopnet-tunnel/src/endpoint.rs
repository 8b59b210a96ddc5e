//! Outbound endpoint for other routers' tunnels.

use std::sync::{Arc, Weak};

use hopnet_types::identity::{RouterHash, TunnelId};
use hopnet_types::message::TunnelMessage;
use hopnet_types::tunnel::HopConfig;
use tracing::{trace, warn};

use crate::context::RouterContext;
use crate::dispatcher::TunnelDispatcher;
use crate::distributor::OutboundMessageDistributor;
use crate::hop::HopTransform;
use crate::participant::record_rejection;
use crate::reassembly::{DefragmentedReceiver, FragmentHandler};
use crate::stats;
use crate::throttle::{Location, ParticipatingThrottle};
use crate::{Cell, Result, TunnelError};

/// Decodes reassembled messages and sends them where their instructions say,
/// subject to admission control.
struct EndpointDelivery {
    tunnel_id: TunnelId,
    throttle: Arc<ParticipatingThrottle>,
    distributor: OutboundMessageDistributor,
}

impl DefragmentedReceiver for EndpointDelivery {
    fn receive_complete(&self, data: Vec<u8>, to_router: Option<RouterHash>, to_tunnel: Option<TunnelId>) {
        let msg = match TunnelMessage::from_bytes(&data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(tunnel = %self.tunnel_id, error = %e, "undecodable message at outbound endpoint");
                return;
            }
        };
        if self
            .throttle
            .should_drop(Location::OutboundEndpoint, msg.kind, msg.size())
        {
            trace!(tunnel = %self.tunnel_id, kind = ?msg.kind, "outbound endpoint message dropped by throttle");
            return;
        }
        self.distributor.distribute(msg, to_router, to_tunnel);
    }
}

/// Last hop of an outbound tunnel: applies its layer, reassembles and
/// delivers.
pub struct OutboundTunnelEndpoint {
    ctx: Arc<RouterContext>,
    tunnel_id: TunnelId,
    config: Arc<HopConfig>,
    transform: HopTransform,
    handler: Arc<FragmentHandler>,
}

impl OutboundTunnelEndpoint {
    /// # Errors
    ///
    /// - [`TunnelError::Config`] if `hop` has no receive tunnel
    pub fn new(
        ctx: Arc<RouterContext>,
        hop: Arc<HopConfig>,
        throttle: Arc<ParticipatingThrottle>,
        dispatcher: Weak<TunnelDispatcher>,
    ) -> Result<Self> {
        let tunnel_id = hop
            .receive_tunnel()
            .ok_or_else(|| TunnelError::Config("outbound endpoint has no tunnel id".into()))?;
        let delivery = EndpointDelivery {
            tunnel_id,
            throttle,
            distributor: OutboundMessageDistributor::new(ctx.clone(), dispatcher),
        };
        let handler = FragmentHandler::new(ctx.clone(), Arc::new(delivery));
        let transform = HopTransform::participant(&hop, ctx.validator().clone());
        Ok(Self {
            ctx,
            tunnel_id,
            config: hop,
            transform,
            handler,
        })
    }

    pub fn tunnel_id(&self) -> TunnelId {
        self.tunnel_id
    }

    pub fn config(&self) -> &Arc<HopConfig> {
        &self.config
    }

    pub fn pending_fragments(&self) -> usize {
        self.handler.pending_count()
    }

    /// Handle one cell from `from`. Failures are counted, never returned.
    pub fn dispatch(&self, mut cell: Box<Cell>, from: &RouterHash) {
        stats::incr(&self.ctx.stats().cells_received);
        if let Err(e) = self.transform.process(&mut cell, from) {
            record_rejection(&self.ctx, self.tunnel_id, &e);
            return;
        }
        self.config.increment_processed_messages();
        if let Err(e) = self.handler.receive_cell(&cell) {
            warn!(tunnel = %self.tunnel_id, error = %e, "outbound endpoint dropped cell");
        }
    }
}

#[cfg(test)]
mod tests {
    use hopnet_types::clock::Clock;
    use super::*;
    use crate::codec::{CellWriter, Delivery};
    use crate::config::BandwidthConfig;
    use crate::context::testing::{hash, router, TestRouter};
    use hopnet_types::message::{MessageType, TunnelGatewayMessage};
    use hopnet_types::tunnel::{TunnelCreatorConfig, TunnelDirection};

    fn endpoint(r: &TestRouter, cfg: &TunnelCreatorConfig) -> OutboundTunnelEndpoint {
        let throttle = Arc::new(ParticipatingThrottle::new(
            &BandwidthConfig::default(),
            r.ctx.clock().clone(),
            r.ctx.stats().clone(),
        ));
        let hop = Arc::new(cfg.hop_for_participant(1).expect("endpoint hop"));
        OutboundTunnelEndpoint::new(r.ctx.clone(), hop, throttle, Weak::new()).expect("endpoint")
    }

    fn gateway_cell(cfg: &TunnelCreatorConfig, delivery: Delivery, msg: &TunnelMessage) -> Box<Cell> {
        let mut writer = CellWriter::new();
        writer
            .write_first(&delivery, None, &msg.to_bytes().expect("encode"))
            .expect("write");
        let (mut cell, _) = writer.seal();
        HopTransform::outbound_gateway(cfg)
            .originate(&mut cell)
            .expect("originate");
        cell
    }

    #[test]
    fn test_delivers_to_router() {
        let r = router(2);
        let cfg = TunnelCreatorConfig::generate(TunnelDirection::Outbound, hash(1), &[hash(1), hash(2)], r.clock.now(), 600_000)
            .expect("tunnel");
        let obep = endpoint(&r, &cfg);

        let msg = TunnelMessage::new(MessageType::DatabaseStore, vec![1; 40], u64::MAX);
        obep.dispatch(gateway_cell(&cfg, Delivery::Router(hash(9)), &msg), &hash(1));

        assert_eq!(r.outbound.take(), vec![(hash(9), msg.clone())]);
        assert_eq!(obep.config().processed_messages(), 1);
        assert_eq!(r.ctx.stats().snapshot().participating_bytes, msg.size() as u64);
    }

    #[test]
    fn test_delivers_to_tunnel() {
        let r = router(2);
        let cfg = TunnelCreatorConfig::generate(TunnelDirection::Outbound, hash(1), &[hash(1), hash(2)], r.clock.now(), 600_000)
            .expect("tunnel");
        let obep = endpoint(&r, &cfg);
        let target = TunnelId::new(77).expect("id");

        let msg = TunnelMessage::new(MessageType::Garlic, vec![2; 10], u64::MAX);
        let delivery = Delivery::Tunnel {
            router: hash(5),
            tunnel: target,
        };
        obep.dispatch(gateway_cell(&cfg, delivery, &msg), &hash(1));

        let sent = r.outbound.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, hash(5));
        let gw = TunnelGatewayMessage::from_message(&sent[0].1).expect("gateway message");
        assert_eq!(gw.tunnel_id, target);
        assert_eq!(gw.message, msg);
    }

    #[test]
    fn test_wrong_previous_hop() {
        let r = router(2);
        let cfg = TunnelCreatorConfig::generate(TunnelDirection::Outbound, hash(1), &[hash(1), hash(2)], r.clock.now(), 600_000)
            .expect("tunnel");
        let obep = endpoint(&r, &cfg);
        let msg = TunnelMessage::new(MessageType::Data, vec![], u64::MAX);
        obep.dispatch(gateway_cell(&cfg, Delivery::Router(hash(9)), &msg), &hash(4));
        assert!(r.outbound.take().is_empty());
        assert_eq!(r.ctx.stats().snapshot().invalid_previous_hop, 1);
    }
}
