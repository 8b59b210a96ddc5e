//! Final delivery of reassembled messages.
//!
//! | Delivery | Target is us | Target is another router |
//! |---|---|---|
//! | local | inbound pool | n/a |
//! | router | inbound pool | outbound queue |
//! | tunnel | our inbound gateway | outbound queue, wrapped as TunnelGateway |

use std::sync::{Arc, Weak};

use hopnet_types::identity::{RouterHash, TunnelId};
use hopnet_types::message::{MessageType, TunnelGatewayMessage, TunnelMessage};
use hopnet_types::Hash;
use tracing::{debug, trace, warn};

use crate::codec::Delivery;
use crate::context::RouterContext;
use crate::dispatcher::TunnelDispatcher;
use crate::reassembly::DefragmentedReceiver;
use crate::stats;

/// Routes `msg` per its delivery instructions. `destination` is passed to the
/// inbound pool for local delivery.
fn route(
    ctx: &RouterContext,
    dispatcher: &Weak<TunnelDispatcher>,
    msg: TunnelMessage,
    delivery: Delivery,
    destination: Option<Hash>,
) {
    let us = ctx.router_hash();
    match delivery {
        Delivery::Local => ctx.inbound().add(msg, destination),
        Delivery::Router(router) if router == us => ctx.inbound().add(msg, destination),
        Delivery::Router(router) => {
            trace!(peer = %router, kind = ?msg.kind, "forwarding to router");
            ctx.outbound().send(router, msg);
        }
        Delivery::Tunnel { router, tunnel } => {
            let gateway = TunnelGatewayMessage::new(tunnel, msg);
            if router == us {
                match dispatcher.upgrade() {
                    Some(dispatcher) => dispatcher.dispatch_gateway(gateway),
                    None => debug!(tunnel = %tunnel, "dispatcher gone, dropping message"),
                }
                return;
            }
            match gateway.into_message() {
                Ok(wrapped) => {
                    trace!(peer = %router, tunnel = %tunnel, "forwarding to tunnel");
                    ctx.outbound().send(router, wrapped);
                }
                Err(e) => warn!(tunnel = %tunnel, error = %e, "cannot wrap message for gateway"),
            }
        }
    }
}

/// Whether a client tunnel may carry `kind` to us.
fn allowed_in_client_tunnel(kind: MessageType) -> bool {
    !matches!(
        kind,
        MessageType::DatabaseLookup
            | MessageType::TunnelBuild
            | MessageType::TunnelBuildReply
            | MessageType::VariableTunnelBuild
            | MessageType::VariableTunnelBuildReply
            | MessageType::TunnelData
            | MessageType::TunnelGateway
    )
}

/// Delivers messages that came out of one of our inbound tunnels.
pub struct InboundMessageDistributor {
    ctx: Arc<RouterContext>,
    dispatcher: Weak<TunnelDispatcher>,
    destination: Option<Hash>,
}

impl InboundMessageDistributor {
    /// `destination` is set for client tunnels, `None` for exploratory ones.
    pub fn new(
        ctx: Arc<RouterContext>,
        dispatcher: Weak<TunnelDispatcher>,
        destination: Option<Hash>,
    ) -> Self {
        Self {
            ctx,
            dispatcher,
            destination,
        }
    }

    pub fn distribute(
        &self,
        msg: TunnelMessage,
        to_router: Option<RouterHash>,
        to_tunnel: Option<TunnelId>,
    ) {
        if self.destination.is_some() && !allowed_in_client_tunnel(msg.kind) {
            stats::incr(&self.ctx.stats().dangerous_dropped);
            warn!(kind = ?msg.kind, "dropping message not allowed down a client tunnel");
            return;
        }
        let delivery = Delivery::from_target(to_router, to_tunnel);
        route(&self.ctx, &self.dispatcher, msg, delivery, self.destination);
    }
}

impl DefragmentedReceiver for InboundMessageDistributor {
    fn receive_complete(&self, data: Vec<u8>, to_router: Option<RouterHash>, to_tunnel: Option<TunnelId>) {
        match TunnelMessage::from_bytes(&data) {
            Ok(msg) => self.distribute(msg, to_router, to_tunnel),
            Err(e) => warn!(error = %e, len = data.len(), "undecodable message at inbound endpoint"),
        }
    }
}

/// Delivers messages that came out of an outbound tunnel, at the endpoint
/// or through a zero-hop gateway.
pub struct OutboundMessageDistributor {
    ctx: Arc<RouterContext>,
    dispatcher: Weak<TunnelDispatcher>,
}

impl OutboundMessageDistributor {
    pub fn new(ctx: Arc<RouterContext>, dispatcher: Weak<TunnelDispatcher>) -> Self {
        Self { ctx, dispatcher }
    }

    pub fn distribute(
        &self,
        msg: TunnelMessage,
        to_router: Option<RouterHash>,
        to_tunnel: Option<TunnelId>,
    ) {
        let delivery = Delivery::from_target(to_router, to_tunnel);
        route(&self.ctx, &self.dispatcher, msg, delivery, None);
    }
}
