//! Per-hop layer transform.
//!
//! Every hop holds one [`HopTransform`], chosen by role when it joins:
//!
//! | Role | Operation | Checks |
//! |---|---|---|
//! | inbound gateway | encrypt with its own layer | none |
//! | outbound gateway | decrypt every later hop's layer, last hop first | none |
//! | participant (incl. outbound endpoint) | encrypt with its own layer | previous hop, IV replay |
//! | inbound endpoint | decrypt every earlier hop's layer, last first | previous hop, IV replay |
//!
//! Gateways call [`HopTransform::originate`] on freshly sealed cells; every
//! other role calls [`HopTransform::process`] on cells from the network.

use std::sync::{Arc, OnceLock};

use hopnet_crypto::aes256::LayerCipher;
use hopnet_replay::IvValidator;
use hopnet_types::identity::RouterHash;
use hopnet_types::tunnel::{HopConfig, TunnelCreatorConfig};

use crate::{Cell, Result, TunnelError, IV_SIZE};

/// Layers a gateway applies to cells it originates.
pub enum GatewayLayers {
    /// A foreign or own inbound gateway: its single layer.
    Inbound(LayerCipher),
    /// Our outbound gateway: every later hop's layer, in decrypt order.
    Outbound(Vec<LayerCipher>),
}

/// The router cells must arrive from. Latches to the first sender when the
/// hop was configured without one.
pub struct PreviousHop(OnceLock<RouterHash>);

impl PreviousHop {
    pub fn new(configured: Option<RouterHash>) -> Self {
        match configured {
            Some(peer) => Self(OnceLock::from(peer)),
            None => Self(OnceLock::new()),
        }
    }

    /// The expected previous hop, once known.
    pub fn get(&self) -> Option<RouterHash> {
        self.0.get().copied()
    }

    fn check(&self, from: &RouterHash) -> Result<()> {
        let expected = *self.0.get_or_init(|| *from);
        if expected != *from {
            return Err(TunnelError::InvalidPreviousHop {
                expected,
                actual: *from,
            });
        }
        Ok(())
    }
}

/// Role-specific crypto for one hop of one tunnel.
pub enum HopTransform {
    Gateway(GatewayLayers),
    Participant {
        layer: LayerCipher,
        previous: PreviousHop,
        validator: Arc<dyn IvValidator>,
    },
    EndpointUndo {
        layers: Vec<LayerCipher>,
        previous: PreviousHop,
        validator: Arc<dyn IvValidator>,
    },
}

impl HopTransform {
    /// Gateway of an inbound tunnel, ours or someone else's.
    pub fn inbound_gateway(hop: &HopConfig) -> Self {
        Self::Gateway(GatewayLayers::Inbound(hop.layer_cipher()))
    }

    /// Gateway of an outbound tunnel we created.
    pub fn outbound_gateway(cfg: &TunnelCreatorConfig) -> Self {
        let layers = cfg.configs()[1..]
            .iter()
            .rev()
            .map(|hop| hop.layer_cipher())
            .collect();
        Self::Gateway(GatewayLayers::Outbound(layers))
    }

    /// A middle hop, or the endpoint of an outbound tunnel.
    pub fn participant(hop: &HopConfig, validator: Arc<dyn IvValidator>) -> Self {
        Self::Participant {
            layer: hop.layer_cipher(),
            previous: PreviousHop::new(hop.receive_from()),
            validator,
        }
    }

    /// Endpoint of an inbound tunnel we created.
    pub fn inbound_endpoint(cfg: &TunnelCreatorConfig, validator: Arc<dyn IvValidator>) -> Self {
        let configs = cfg.configs();
        let last = configs.len().saturating_sub(1);
        let layers = configs[..last]
            .iter()
            .rev()
            .map(|hop| hop.layer_cipher())
            .collect();
        let previous = configs
            .get(last)
            .and_then(|hop| hop.receive_from())
            .or_else(|| last.checked_sub(1).and_then(|i| cfg.peer(i)));
        Self::EndpointUndo {
            layers,
            previous: PreviousHop::new(previous),
            validator,
        }
    }

    pub fn is_gateway(&self) -> bool {
        matches!(self, Self::Gateway(_))
    }

    /// Apply the gateway layers to a sealed cell.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::Internal`] if this is not a gateway transform
    pub fn originate(&self, cell: &mut Cell) -> Result<()> {
        match self {
            Self::Gateway(GatewayLayers::Inbound(layer)) => layer.encrypt(cell)?,
            Self::Gateway(GatewayLayers::Outbound(layers)) => {
                for layer in layers {
                    layer.decrypt(cell)?;
                }
            }
            _ => {
                return Err(TunnelError::Internal(
                    "only gateways originate cells".into(),
                ))
            }
        }
        Ok(())
    }

    /// Check and transform a cell received from `from`.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::InvalidPreviousHop`] if `from` is not the previous hop
    /// - [`TunnelError::Replay`] if the IV was seen recently
    /// - [`TunnelError::Internal`] if this is a gateway transform
    pub fn process(&self, cell: &mut Cell, from: &RouterHash) -> Result<()> {
        match self {
            Self::Participant {
                layer,
                previous,
                validator,
            } => {
                previous.check(from)?;
                validate_iv(validator.as_ref(), cell)?;
                layer.encrypt(cell)?;
            }
            Self::EndpointUndo {
                layers,
                previous,
                validator,
            } => {
                previous.check(from)?;
                validate_iv(validator.as_ref(), cell)?;
                for layer in layers {
                    layer.decrypt(cell)?;
                }
            }
            Self::Gateway(_) => {
                return Err(TunnelError::Internal(
                    "gateways do not process received cells".into(),
                ))
            }
        }
        Ok(())
    }
}

fn validate_iv(validator: &dyn IvValidator, cell: &Cell) -> Result<()> {
    let mut iv = [0u8; IV_SIZE];
    let mut head = [0u8; IV_SIZE];
    iv.copy_from_slice(&cell[..IV_SIZE]);
    head.copy_from_slice(&cell[IV_SIZE..2 * IV_SIZE]);
    if !validator.receive_iv(&iv, &head) {
        return Err(TunnelError::Replay);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, CellWriter, Delivery};
    use hopnet_replay::BloomFilterIvValidator;
    use hopnet_types::clock::ManualClock;
    use hopnet_types::tunnel::TunnelDirection;

    fn validator() -> Arc<dyn IvValidator> {
        let clock = Arc::new(ManualClock::new(0));
        Arc::new(BloomFilterIvValidator::with_params(16, 600_000, clock).expect("validator"))
    }

    fn peers(n: usize) -> Vec<RouterHash> {
        (0..n)
            .map(|i| RouterHash::from_bytes([i as u8 + 1; 32]))
            .collect()
    }

    fn sealed_cell() -> Box<Cell> {
        let mut writer = CellWriter::new();
        writer
            .write_first(&Delivery::Local, None, b"layered payload")
            .expect("write");
        writer.seal().0
    }

    fn outbound_roundtrip(n: usize) {
        let p = peers(n);
        let cfg = TunnelCreatorConfig::generate(TunnelDirection::Outbound, p[0], &p, 0, 600_000)
            .expect("tunnel");
        let original = sealed_cell();
        let mut cell = original.clone();

        HopTransform::outbound_gateway(&cfg)
            .originate(&mut cell)
            .expect("originate");
        for i in 1..n {
            let hop = cfg.config(i).expect("hop");
            HopTransform::participant(hop, validator())
                .process(&mut cell, &p[i - 1])
                .expect("process");
        }
        assert_eq!(cell, original);
        codec::open(&cell).expect("checksum holds");
    }

    fn inbound_roundtrip(n: usize) {
        let p = peers(n);
        let local = p[n - 1];
        let cfg = TunnelCreatorConfig::generate(TunnelDirection::Inbound, local, &p, 0, 600_000)
            .expect("tunnel");
        let original = sealed_cell();
        let mut cell = original.clone();

        HopTransform::inbound_gateway(cfg.config(0).expect("gateway"))
            .originate(&mut cell)
            .expect("originate");
        assert_ne!(cell, original);
        for i in 1..n - 1 {
            let hop = cfg.config(i).expect("hop");
            HopTransform::participant(hop, validator())
                .process(&mut cell, &p[i - 1])
                .expect("process");
        }
        HopTransform::inbound_endpoint(&cfg, validator())
            .process(&mut cell, &p[n - 2])
            .expect("undo");
        assert_eq!(cell, original);
    }

    #[test]
    fn test_outbound_inverse() {
        for n in [1, 2, 8] {
            outbound_roundtrip(n);
        }
    }

    #[test]
    fn test_inbound_inverse() {
        for n in [2, 3, 8] {
            inbound_roundtrip(n);
        }
    }

    #[test]
    fn test_replay_rejected() {
        let hop = HopConfig::random_keys();
        let transform = HopTransform::participant(&hop, validator());
        let from = RouterHash::from_bytes([9; 32]);
        let original = sealed_cell();

        let mut first = original.clone();
        transform.process(&mut first, &from).expect("first accepted");
        let mut second = original.clone();
        assert!(matches!(
            transform.process(&mut second, &from),
            Err(TunnelError::Replay)
        ));
        assert_eq!(second, original);
    }

    #[test]
    fn test_previous_hop_enforced() {
        let expected = RouterHash::from_bytes([1; 32]);
        let hop = HopConfig::random_keys().with_receive_from(expected);
        let transform = HopTransform::participant(&hop, validator());
        let mut cell = sealed_cell();
        let result = transform.process(&mut cell, &RouterHash::from_bytes([2; 32]));
        assert!(matches!(result, Err(TunnelError::InvalidPreviousHop { .. })));
    }

    #[test]
    fn test_previous_hop_latches() {
        let transform = HopTransform::participant(&HopConfig::random_keys(), validator());
        let first = RouterHash::from_bytes([1; 32]);
        transform.process(&mut sealed_cell(), &first).expect("latch");
        let result = transform.process(&mut sealed_cell(), &RouterHash::from_bytes([2; 32]));
        assert!(matches!(
            result,
            Err(TunnelError::InvalidPreviousHop { expected, .. }) if expected == first
        ));
    }

    #[test]
    fn test_role_mismatch() {
        let hop = HopConfig::random_keys();
        let gateway = HopTransform::inbound_gateway(&hop);
        assert!(gateway.is_gateway());
        let from = RouterHash::from_bytes([1; 32]);
        assert!(gateway.process(&mut sealed_cell(), &from).is_err());
        let participant = HopTransform::participant(&hop, validator());
        assert!(participant.originate(&mut sealed_cell()).is_err());
    }
}
