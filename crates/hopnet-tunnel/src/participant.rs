//! Middle hops of other routers' tunnels, and the endpoints of our own
//! inbound tunnels.

use std::sync::{Arc, Weak};

use hopnet_types::identity::{RouterHash, TunnelId};
use hopnet_types::message::MessageType;
use hopnet_types::tunnel::{HopConfig, TunnelCreatorConfig};
use tracing::{trace, warn};

use crate::context::RouterContext;
use crate::dispatcher::TunnelDispatcher;
use crate::distributor::InboundMessageDistributor;
use crate::hop::HopTransform;
use crate::reassembly::FragmentHandler;
use crate::stats;
use crate::throttle::{Location, ParticipatingThrottle};
use crate::{Cell, Result, TunnelError, CELL_SIZE};

/// Count and log a cell the hop transform refused.
pub(crate) fn record_rejection(ctx: &RouterContext, tunnel: TunnelId, error: &TunnelError) {
    let s = ctx.stats();
    match error {
        TunnelError::Replay => stats::incr(&s.replayed_cells),
        TunnelError::InvalidPreviousHop { .. } => stats::incr(&s.invalid_previous_hop),
        TunnelError::Corrupt(_) => stats::incr(&s.corrupt_cells),
        _ => {}
    }
    warn!(tunnel = %tunnel, error = %error, "dropping cell");
}

enum Role {
    Forward {
        next: RouterHash,
        send_tunnel: TunnelId,
        throttle: Arc<ParticipatingThrottle>,
    },
    InboundEndpoint {
        handler: Arc<FragmentHandler>,
    },
}

/// Receives cells for one tunnel id and either passes them on or, at the
/// end of one of our inbound tunnels, reassembles them.
pub struct TunnelParticipant {
    ctx: Arc<RouterContext>,
    tunnel_id: TunnelId,
    config: Arc<HopConfig>,
    transform: HopTransform,
    role: Role,
}

impl TunnelParticipant {
    /// A middle hop of someone else's tunnel.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::Config`] if `hop` lacks a receive tunnel, next hop or
    ///   send tunnel
    pub fn forwarding(
        ctx: Arc<RouterContext>,
        hop: Arc<HopConfig>,
        throttle: Arc<ParticipatingThrottle>,
    ) -> Result<Self> {
        let (Some(tunnel_id), Some(next), Some(send_tunnel)) =
            (hop.receive_tunnel(), hop.send_to(), hop.send_tunnel())
        else {
            return Err(TunnelError::Config("participant hop is incomplete".into()));
        };
        let transform = HopTransform::participant(&hop, ctx.validator().clone());
        Ok(Self {
            ctx,
            tunnel_id,
            config: hop,
            transform,
            role: Role::Forward {
                next,
                send_tunnel,
                throttle,
            },
        })
    }

    /// The last hop of an inbound tunnel we created.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::Config`] if the last hop has no receive tunnel
    pub fn inbound_endpoint(
        ctx: Arc<RouterContext>,
        cfg: &TunnelCreatorConfig,
        dispatcher: Weak<TunnelDispatcher>,
    ) -> Result<Self> {
        let config = cfg
            .length()
            .checked_sub(1)
            .and_then(|last| cfg.config(last))
            .cloned()
            .ok_or_else(|| TunnelError::Config("empty tunnel".into()))?;
        let tunnel_id = config
            .receive_tunnel()
            .ok_or_else(|| TunnelError::Config("inbound endpoint has no tunnel id".into()))?;
        let distributor = InboundMessageDistributor::new(ctx.clone(), dispatcher, cfg.destination());
        let handler = FragmentHandler::new(ctx.clone(), Arc::new(distributor));
        let transform = HopTransform::inbound_endpoint(cfg, ctx.validator().clone());
        Ok(Self {
            ctx,
            tunnel_id,
            config,
            transform,
            role: Role::InboundEndpoint { handler },
        })
    }

    pub fn tunnel_id(&self) -> TunnelId {
        self.tunnel_id
    }

    pub fn config(&self) -> &Arc<HopConfig> {
        &self.config
    }

    pub fn is_inbound_endpoint(&self) -> bool {
        matches!(self.role, Role::InboundEndpoint { .. })
    }

    /// Partial messages held by an inbound endpoint.
    pub fn pending_fragments(&self) -> usize {
        match &self.role {
            Role::InboundEndpoint { handler } => handler.pending_count(),
            Role::Forward { .. } => 0,
        }
    }

    /// Handle one cell from `from`. Failures are counted, never returned.
    pub fn dispatch(&self, mut cell: Box<Cell>, from: &RouterHash) {
        stats::incr(&self.ctx.stats().cells_received);
        if let Err(e) = self.transform.process(&mut cell, from) {
            record_rejection(&self.ctx, self.tunnel_id, &e);
            return;
        }
        match &self.role {
            Role::Forward {
                next,
                send_tunnel,
                throttle,
            } => {
                if throttle.should_drop(Location::Participant, MessageType::TunnelData, CELL_SIZE) {
                    trace!(tunnel = %self.tunnel_id, "participating cell dropped by throttle");
                    return;
                }
                self.config.increment_processed_messages();
                self.ctx.send_cell(*next, *send_tunnel, cell);
            }
            Role::InboundEndpoint { handler } => {
                self.config.increment_processed_messages();
                if let Err(e) = handler.receive_cell(&cell) {
                    warn!(tunnel = %self.tunnel_id, error = %e, "inbound endpoint dropped cell");
                }
            }
        }
    }
}
