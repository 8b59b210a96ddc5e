//! Tunnel configuration as seen by one router.
//!
//! A [`HopConfig`] is what a router knows about its own position in a tunnel:
//! where cells arrive from, where they go next, and the two keys for its
//! layer. A [`TunnelCreatorConfig`] is the full gateway-first hop list that
//! only the tunnel's creator holds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hopnet_crypto::aes256::LayerCipher;
use hopnet_crypto::keys::SessionKey;
use serde::{Deserialize, Serialize};

use crate::identity::{RouterHash, TunnelId};
use crate::{Hash, Result, TypesError};

/// Per-hop state for one tunnel at one router.
#[derive(Debug)]
pub struct HopConfig {
    receive_tunnel: Option<TunnelId>,
    send_tunnel: Option<TunnelId>,
    receive_from: Option<RouterHash>,
    send_to: Option<RouterHash>,
    layer_key: SessionKey,
    iv_key: SessionKey,
    creation: u64,
    expiration: u64,
    processed: AtomicU64,
}

impl HopConfig {
    /// Create a hop with the given layer and IV keys and no neighbors.
    pub fn new(layer_key: SessionKey, iv_key: SessionKey) -> Self {
        Self {
            receive_tunnel: None,
            send_tunnel: None,
            receive_from: None,
            send_to: None,
            layer_key,
            iv_key,
            creation: 0,
            expiration: 0,
            processed: AtomicU64::new(0),
        }
    }

    /// Create a hop with freshly generated keys.
    pub fn random_keys() -> Self {
        Self::new(SessionKey::random(), SessionKey::random())
    }

    pub fn with_receive_tunnel(mut self, id: TunnelId) -> Self {
        self.receive_tunnel = Some(id);
        self
    }

    pub fn with_send_tunnel(mut self, id: TunnelId) -> Self {
        self.send_tunnel = Some(id);
        self
    }

    pub fn with_receive_from(mut self, peer: RouterHash) -> Self {
        self.receive_from = Some(peer);
        self
    }

    pub fn with_send_to(mut self, peer: RouterHash) -> Self {
        self.send_to = Some(peer);
        self
    }

    /// Set the creation and expiration timestamps (ms).
    pub fn with_lifetime(mut self, creation: u64, expiration: u64) -> Self {
        self.creation = creation;
        self.expiration = expiration;
        self
    }

    pub fn receive_tunnel(&self) -> Option<TunnelId> {
        self.receive_tunnel
    }

    pub fn send_tunnel(&self) -> Option<TunnelId> {
        self.send_tunnel
    }

    /// Previous hop. `None` at a gateway.
    pub fn receive_from(&self) -> Option<RouterHash> {
        self.receive_from
    }

    /// Next hop. `None` at an endpoint.
    pub fn send_to(&self) -> Option<RouterHash> {
        self.send_to
    }

    pub fn layer_key(&self) -> &SessionKey {
        &self.layer_key
    }

    pub fn iv_key(&self) -> &SessionKey {
        &self.iv_key
    }

    pub fn creation(&self) -> u64 {
        self.creation
    }

    pub fn expiration(&self) -> u64 {
        self.expiration
    }

    /// Expanded cipher for this hop's layer.
    pub fn layer_cipher(&self) -> LayerCipher {
        LayerCipher::new(&self.layer_key, &self.iv_key)
    }

    /// Count one more cell or message handled for this hop.
    pub fn increment_processed_messages(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Cells or messages handled so far.
    pub fn processed_messages(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

impl Clone for HopConfig {
    /// Copies keys and routing; the processed counter starts over.
    fn clone(&self) -> Self {
        Self {
            receive_tunnel: self.receive_tunnel,
            send_tunnel: self.send_tunnel,
            receive_from: self.receive_from,
            send_to: self.send_to,
            layer_key: self.layer_key.clone(),
            iv_key: self.iv_key.clone(),
            creation: self.creation,
            expiration: self.expiration,
            processed: AtomicU64::new(0),
        }
    }
}

/// Direction of a tunnel relative to its creator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelDirection {
    /// The creator is the gateway.
    Outbound,
    /// The creator is the endpoint.
    Inbound,
}

/// The creator's view of a whole tunnel, gateway first.
#[derive(Debug, Clone)]
pub struct TunnelCreatorConfig {
    hops: Vec<Arc<HopConfig>>,
    peers: Vec<RouterHash>,
    direction: TunnelDirection,
    destination: Option<Hash>,
}

impl TunnelCreatorConfig {
    /// Assemble a tunnel from `(peer, hop)` pairs in gateway-first order.
    ///
    /// # Errors
    ///
    /// - [`TypesError::EmptyTunnel`] if `hops` is empty
    pub fn new(direction: TunnelDirection, hops: Vec<(RouterHash, HopConfig)>) -> Result<Self> {
        if hops.is_empty() {
            return Err(TypesError::EmptyTunnel);
        }
        let (peers, hops): (Vec<_>, Vec<_>) =
            hops.into_iter().map(|(p, h)| (p, Arc::new(h))).unzip();
        Ok(Self {
            hops,
            peers,
            direction,
            destination: None,
        })
    }

    /// Generate a consistent hop chain with random keys and tunnel ids.
    ///
    /// `peers` is gateway-first and must contain `local` at the gateway
    /// (outbound) or endpoint (inbound) position. Every hop expires at
    /// `now + lifetime_ms`.
    pub fn generate(
        direction: TunnelDirection,
        local: RouterHash,
        peers: &[RouterHash],
        now: u64,
        lifetime_ms: u64,
    ) -> Result<Self> {
        let Some(last) = peers.len().checked_sub(1) else {
            return Err(TypesError::EmptyTunnel);
        };
        let ours = match direction {
            TunnelDirection::Outbound => 0,
            TunnelDirection::Inbound => last,
        };
        if peers[ours] != local {
            return Err(TypesError::InvalidConfig(format!(
                "local router must be hop {ours} of an {direction:?} tunnel"
            )));
        }

        let ids: Vec<TunnelId> = peers.iter().map(|_| TunnelId::random()).collect();
        let mut hops = Vec::with_capacity(peers.len());
        for (i, peer) in peers.iter().enumerate() {
            let mut hop = HopConfig::random_keys()
                .with_receive_tunnel(ids[i])
                .with_lifetime(now, now + lifetime_ms);
            if i > 0 {
                hop = hop.with_receive_from(peers[i - 1]);
            }
            if i < last {
                hop = hop.with_send_tunnel(ids[i + 1]).with_send_to(peers[i + 1]);
            } else if last == 0 {
                // A zero-hop gateway addresses itself.
                hop = hop.with_send_tunnel(ids[0]);
            }
            hops.push((*peer, hop));
        }
        Self::new(direction, hops)
    }

    /// Mark this as a client tunnel serving `destination`.
    pub fn with_destination(mut self, destination: Hash) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Number of hops, gateway and endpoint included.
    pub fn length(&self) -> usize {
        self.hops.len()
    }

    pub fn config(&self, hop: usize) -> Option<&Arc<HopConfig>> {
        self.hops.get(hop)
    }

    pub fn configs(&self) -> &[Arc<HopConfig>] {
        &self.hops
    }

    pub fn peer(&self, hop: usize) -> Option<RouterHash> {
        self.peers.get(hop).copied()
    }

    pub fn peers(&self) -> &[RouterHash] {
        &self.peers
    }

    pub fn direction(&self) -> TunnelDirection {
        self.direction
    }

    pub fn is_inbound(&self) -> bool {
        self.direction == TunnelDirection::Inbound
    }

    /// Destination served by a client tunnel. `None` for exploratory tunnels.
    pub fn destination(&self) -> Option<Hash> {
        self.destination
    }

    /// Earliest hop expiration.
    pub fn expiration(&self) -> u64 {
        self.hops
            .iter()
            .map(|h| h.expiration())
            .min()
            .unwrap_or_default()
    }

    /// Hop configuration to hand to `peer(hop)` when it joins.
    pub fn hop_for_participant(&self, hop: usize) -> Option<HopConfig> {
        self.hops.get(hop).map(|h| HopConfig::clone(h))
    }
}
