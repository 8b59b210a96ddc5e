//! Gateway crypto and next-hop delivery.

use std::sync::Arc;

use hopnet_types::identity::{RouterHash, TunnelId};
use hopnet_types::tunnel::{HopConfig, TunnelCreatorConfig};
use tracing::warn;

use crate::context::RouterContext;
use crate::hop::HopTransform;
use crate::preprocessor::{Receiver, Sender};
use crate::{Cell, Result, TunnelError};

/// Applies a gateway [`HopTransform`] before passing cells on.
pub struct GatewaySender {
    transform: HopTransform,
}

impl GatewaySender {
    /// Outbound gateway of a tunnel we created: pre-decrypts every later hop.
    pub fn outbound(cfg: &TunnelCreatorConfig) -> Self {
        Self {
            transform: HopTransform::outbound_gateway(cfg),
        }
    }

    /// Inbound gateway: encrypts with its own layer.
    pub fn inbound(hop: &HopConfig) -> Self {
        Self {
            transform: HopTransform::inbound_gateway(hop),
        }
    }
}

impl Sender for GatewaySender {
    fn send_preprocessed(&self, mut cell: Box<Cell>, receiver: &dyn Receiver) -> Option<u32> {
        if let Err(e) = self.transform.originate(&mut cell) {
            warn!(error = %e, "gateway transform failed, dropping cell");
            return None;
        }
        receiver.receive_encrypted(cell)
    }
}

/// Sends encrypted cells to a gateway's next hop as TunnelData messages,
/// counting each against the gateway hop.
pub struct NextHopReceiver {
    ctx: Arc<RouterContext>,
    hop: Arc<HopConfig>,
    peer: RouterHash,
    tunnel: TunnelId,
}

impl NextHopReceiver {
    /// # Errors
    ///
    /// - [`TunnelError::Config`] if `hop` has no next hop or send tunnel
    pub fn new(ctx: Arc<RouterContext>, hop: Arc<HopConfig>) -> Result<Self> {
        let (Some(peer), Some(tunnel)) = (hop.send_to(), hop.send_tunnel()) else {
            return Err(TunnelError::Config("gateway hop has no next hop".into()));
        };
        Ok(Self {
            ctx,
            hop,
            peer,
            tunnel,
        })
    }

    pub fn peer(&self) -> RouterHash {
        self.peer
    }
}

impl Receiver for NextHopReceiver {
    fn receive_encrypted(&self, cell: Box<Cell>) -> Option<u32> {
        self.hop.increment_processed_messages();
        Some(self.ctx.send_cell(self.peer, self.tunnel, cell))
    }
}
