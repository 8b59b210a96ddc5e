//! Integration tests for the hopnet tunnel data plane.
//!
//! [`Network`] wires several routers together in memory. Every router gets
//! its own context, dispatcher and timer on one shared [`ManualClock`];
//! messages a router sends are queued on a shared wire and only delivered
//! when the test calls [`Network::run`], so delivery order is deterministic
//! and no router ever re-enters another from inside a send.
//!
//! Run all integration tests:
//! ```sh
//! cargo test -p hopnet-integration-tests
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use hopnet_replay::BloomFilterIvValidator;
use hopnet_tunnel::config::TunnelConfig;
use hopnet_tunnel::context::{InboundMessagePool, OutboundQueue, ProfileEvent, ProfileSink, RouterContext};
use hopnet_tunnel::dispatcher::TunnelDispatcher;
use hopnet_tunnel::timer::SimpleTimer;
use hopnet_tunnel::Result;
use hopnet_types::clock::{Clock, ManualClock};
use hopnet_types::identity::RouterHash;
use hopnet_types::message::TunnelMessage;
use hopnet_types::tunnel::{TunnelCreatorConfig, TunnelDirection};
use hopnet_types::Hash;

/// Clock value every network starts at.
pub const START_MS: u64 = 1_000_000;

/// Tunnel lifetime used by the build helpers.
pub const TUNNEL_LIFETIME_MS: u64 = 10 * 60 * 1000;

/// Router hash of node `i`.
pub fn router_hash(i: usize) -> RouterHash {
    RouterHash::from_bytes([i as u8 + 1; 32])
}

/// A message that arrived at a router's inbound pool.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivered {
    pub message: TunnelMessage,
    pub destination: Option<Hash>,
}

/// Inbound pool that keeps everything for inspection.
#[derive(Default)]
pub struct RecordingPool(Mutex<Vec<Delivered>>);

impl RecordingPool {
    pub fn take(&self) -> Vec<Delivered> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl InboundMessagePool for RecordingPool {
    fn add(&self, message: TunnelMessage, destination: Option<Hash>) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Delivered {
                message,
                destination,
            });
    }
}

/// Profile sink that keeps every event.
#[derive(Default)]
pub struct RecordingProfiles(Mutex<Vec<ProfileEvent>>);

impl RecordingProfiles {
    pub fn events(&self) -> Vec<ProfileEvent> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ProfileSink for RecordingProfiles {
    fn record(&self, event: ProfileEvent) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }
}

/// One message in flight.
#[derive(Debug, Clone)]
pub struct Packet {
    pub from: RouterHash,
    pub to: RouterHash,
    pub message: TunnelMessage,
}

/// Shared in-flight queue. Packets to unknown routers are kept in `lost`.
#[derive(Default)]
pub struct Wire {
    queue: Mutex<VecDeque<Packet>>,
    lost: Mutex<Vec<Packet>>,
}

impl Wire {
    fn push(&self, packet: Packet) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(packet);
    }

    fn pop(&self) -> Option<Packet> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    pub fn in_flight(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Packets addressed to routers outside the network.
    pub fn take_lost(&self) -> Vec<Packet> {
        std::mem::take(&mut *self.lost.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

struct WireQueue {
    from: RouterHash,
    wire: Arc<Wire>,
}

impl OutboundQueue for WireQueue {
    fn send(&self, peer: RouterHash, message: TunnelMessage) {
        self.wire.push(Packet {
            from: self.from,
            to: peer,
            message,
        });
    }
}

/// One router on the in-memory network.
pub struct Node {
    pub hash: RouterHash,
    pub ctx: Arc<RouterContext>,
    pub dispatcher: Arc<TunnelDispatcher>,
    pub pool: Arc<RecordingPool>,
    pub profiles: Arc<RecordingProfiles>,
}

/// Several routers sharing a clock and a wire.
pub struct Network {
    clock: Arc<ManualClock>,
    wire: Arc<Wire>,
    nodes: Vec<Node>,
    config: TunnelConfig,
}

impl Network {
    /// `size` routers with inline pumping and the default batching policy.
    pub fn new(size: usize) -> Result<Self> {
        Self::with_config(
            size,
            TunnelConfig {
                pump_threads: 0,
                ..TunnelConfig::default()
            },
        )
    }

    pub fn with_config(size: usize, config: TunnelConfig) -> Result<Self> {
        let clock = Arc::new(ManualClock::new(START_MS));
        let wire = Arc::new(Wire::default());
        let mut nodes = Vec::with_capacity(size);
        for i in 0..size {
            let hash = router_hash(i);
            let pool = Arc::new(RecordingPool::default());
            let profiles = Arc::new(RecordingProfiles::default());
            let validator = BloomFilterIvValidator::with_params(16, 600_000, clock.clone())?;
            let ctx = RouterContext::builder(hash)
                .clock(clock.clone())
                .timer(SimpleTimer::manual(clock.clone()))
                .validator(Arc::new(validator))
                .outbound(Arc::new(WireQueue {
                    from: hash,
                    wire: wire.clone(),
                }))
                .inbound(pool.clone())
                .profiles(profiles.clone())
                .config(config.clone())
                .build()?;
            let dispatcher = TunnelDispatcher::new(ctx.clone())?;
            nodes.push(Node {
                hash,
                ctx,
                dispatcher,
                pool,
                profiles,
            });
        }
        Ok(Self {
            clock,
            wire,
            nodes,
            config,
        })
    }

    pub fn node(&self, i: usize) -> &Node {
        &self.nodes[i]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn wire(&self) -> &Arc<Wire> {
        &self.wire
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Move the clock and run every timer event that became due.
    pub fn advance(&self, ms: u64) -> usize {
        self.clock.advance(ms);
        self.nodes.iter().map(|n| n.ctx.timer().fire_due()).sum()
    }

    /// Take the next packet off the wire without delivering it.
    pub fn next_packet(&self) -> Option<Packet> {
        self.wire.pop()
    }

    /// Hand one packet to its recipient. Messages a dispatcher does not
    /// handle go to the recipient's inbound pool.
    pub fn deliver(&self, packet: Packet) {
        let Some(node) = self.nodes.iter().find(|n| n.hash == packet.to) else {
            self.wire
                .lost
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(packet);
            return;
        };
        let message = packet.message;
        if !node.dispatcher.receive(message.clone(), packet.from) {
            node.pool.add(message, None);
        }
    }

    /// Deliver packets until the wire is empty. Returns how many were
    /// delivered.
    pub fn run(&self) -> usize {
        self.run_filtered(&mut |_| true)
    }

    /// Like [`Network::run`], silently discarding packets `keep` rejects.
    pub fn run_filtered(&self, keep: &mut dyn FnMut(&Packet) -> bool) -> usize {
        let mut delivered = 0;
        while let Some(packet) = self.wire.pop() {
            if keep(&packet) {
                self.deliver(packet);
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver everything, letting batching delays elapse between rounds.
    pub fn settle(&self) {
        self.settle_filtered(|_| true);
    }

    /// Like [`Network::settle`], silently discarding packets `keep` rejects.
    pub fn settle_filtered<F>(&self, mut keep: F)
    where
        F: FnMut(&Packet) -> bool,
    {
        for _ in 0..10 {
            self.run_filtered(&mut keep);
            self.advance(self.config.batch.delay_ms.max(1));
        }
        self.run_filtered(&mut keep);
    }

    /// Build an outbound tunnel owned by node `owner` through `hops`, joining
    /// every router on the path.
    pub fn build_outbound(&self, owner: usize, hops: &[usize]) -> Result<TunnelCreatorConfig> {
        let path: Vec<usize> = std::iter::once(owner).chain(hops.iter().copied()).collect();
        let cfg = self.generate(TunnelDirection::Outbound, owner, &path)?;
        self.nodes[owner].dispatcher.join_outbound(&cfg)?;
        for (i, &node) in path.iter().enumerate().skip(1) {
            let Some(hop) = cfg.hop_for_participant(i) else {
                continue;
            };
            let dispatcher = &self.nodes[node].dispatcher;
            if i == path.len() - 1 {
                dispatcher.join_outbound_endpoint(hop)?;
            } else {
                dispatcher.join_participant(hop)?;
            }
        }
        Ok(cfg)
    }

    /// Build an exploratory inbound tunnel ending at node `owner`, entered at
    /// `hops[0]`.
    pub fn build_inbound(&self, owner: usize, hops: &[usize]) -> Result<TunnelCreatorConfig> {
        self.build_inbound_for(owner, hops, None)
    }

    /// Build an inbound tunnel, for a client `destination` if given.
    pub fn build_inbound_for(
        &self,
        owner: usize,
        hops: &[usize],
        destination: Option<Hash>,
    ) -> Result<TunnelCreatorConfig> {
        let path: Vec<usize> = hops.iter().copied().chain(std::iter::once(owner)).collect();
        let mut cfg = self.generate(TunnelDirection::Inbound, owner, &path)?;
        if let Some(destination) = destination {
            cfg = cfg.with_destination(destination);
        }
        self.nodes[owner].dispatcher.join_inbound(&cfg)?;
        for (i, &node) in path.iter().enumerate().take(path.len() - 1) {
            let Some(hop) = cfg.hop_for_participant(i) else {
                continue;
            };
            let dispatcher = &self.nodes[node].dispatcher;
            if i == 0 {
                dispatcher.join_inbound_gateway(hop)?;
            } else {
                dispatcher.join_participant(hop)?;
            }
        }
        Ok(cfg)
    }

    fn generate(
        &self,
        direction: TunnelDirection,
        owner: usize,
        path: &[usize],
    ) -> Result<TunnelCreatorConfig> {
        let peers: Vec<RouterHash> = path.iter().map(|&i| router_hash(i)).collect();
        Ok(TunnelCreatorConfig::generate(
            direction,
            router_hash(owner),
            &peers,
            self.now(),
            TUNNEL_LIFETIME_MS,
        )?)
    }

    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.dispatcher.shutdown();
        }
    }
}

/// Collects deliveries over several rounds and checks them against what
/// was sent.
pub struct ExpectingReceiver {
    expected: Vec<TunnelMessage>,
    received: Vec<TunnelMessage>,
}

impl ExpectingReceiver {
    pub fn new(expected: Vec<TunnelMessage>) -> Self {
        Self {
            expected,
            received: Vec::new(),
        }
    }

    /// Take whatever `pool` holds.
    pub fn collect(&mut self, pool: &RecordingPool) {
        self.received
            .extend(pool.take().into_iter().map(|d| d.message));
    }

    /// Every expected message arrived exactly once, in any order, and
    /// nothing else did.
    pub fn received_ok(&self) -> bool {
        if self.received.len() != self.expected.len() {
            return false;
        }
        self.expected
            .iter()
            .all(|m| self.received.iter().filter(|r| *r == m).count() == 1)
    }

    pub fn received(&self) -> &[TunnelMessage] {
        &self.received
    }
}
