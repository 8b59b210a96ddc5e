//! In-process network of routers joined by channels.
//!
//! Each router runs its own inbox thread, timer and pump pool. A router's
//! outbound queue is a non-blocking send on the recipient's inbox, so the
//! data plane runs with the same threading it would have in a full router.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use hopnet_tunnel::config::TunnelConfig;
use hopnet_tunnel::context::{InboundMessagePool, OutboundQueue, ProfileEvent, ProfileSink, RouterContext};
use hopnet_tunnel::dispatcher::{DispatcherCounts, TunnelDispatcher};
use hopnet_tunnel::stats::StatsSnapshot;
use hopnet_types::identity::{RouterHash, TunnelId};
use hopnet_types::message::{MessageType, TunnelMessage};
use hopnet_types::tunnel::{TunnelCreatorConfig, TunnelDirection};
use hopnet_types::Hash;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::SimulationConfig;

/// Lifetime of every simulated tunnel.
const TUNNEL_LIFETIME_MS: u64 = 10 * 60 * 1000;

/// Lifetime of every simulated message.
const MESSAGE_LIFETIME_MS: u64 = 60 * 1000;

enum Envelope {
    Message { from: RouterHash, message: TunnelMessage },
    Stop,
}

/// Outbound queue that posts into the recipient's inbox.
struct ChannelQueue {
    from: RouterHash,
    inboxes: Arc<HashMap<RouterHash, Sender<Envelope>>>,
}

impl OutboundQueue for ChannelQueue {
    fn send(&self, peer: RouterHash, message: TunnelMessage) {
        match self.inboxes.get(&peer) {
            Some(inbox) => {
                let _ = inbox.send(Envelope::Message {
                    from: self.from,
                    message,
                });
            }
            None => warn!(peer = %peer, "no route to router"),
        }
    }
}

/// Counts what reaches a router.
#[derive(Default)]
struct CountingPool {
    messages: AtomicU64,
    bytes: AtomicU64,
    client_messages: AtomicU64,
}

impl InboundMessagePool for CountingPool {
    fn add(&self, message: TunnelMessage, destination: Option<Hash>) {
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(message.payload.len() as u64, Ordering::Relaxed);
        if destination.is_some() {
            self.client_messages.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Tallies profile events per kind.
#[derive(Default)]
struct CountingProfiles {
    joined: AtomicU64,
    rejected: AtomicU64,
    lifetimes: AtomicU64,
    fragments_lost: AtomicU64,
}

impl ProfileSink for CountingProfiles {
    fn record(&self, event: ProfileEvent) {
        let counter = match event {
            ProfileEvent::TunnelJoined { .. } => &self.joined,
            ProfileEvent::TunnelRejected { .. } => &self.rejected,
            ProfileEvent::TunnelLifetime { .. } => &self.lifetimes,
            ProfileEvent::FragmentsLost { .. } => &self.fragments_lost,
            ProfileEvent::DataPushed { .. } => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct SimRouter {
    hash: RouterHash,
    ctx: Arc<RouterContext>,
    dispatcher: Arc<TunnelDispatcher>,
    pool: Arc<CountingPool>,
    profiles: Arc<CountingProfiles>,
    inbox: Sender<Envelope>,
    thread: Option<JoinHandle<()>>,
}

/// One router's line in the report.
#[derive(Debug, Clone, Serialize)]
pub struct RouterReport {
    pub router: String,
    pub delivered: u64,
    pub delivered_bytes: u64,
    pub client_messages: u64,
    pub tunnels_joined: u64,
    pub tunnels_rejected: u64,
    pub tunnels_expired: u64,
    pub fragments_lost: u64,
    pub counts: DispatcherCounts,
    pub stats: StatsSnapshot,
}

/// Outcome of a simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub routers: usize,
    pub hops: usize,
    pub sent: usize,
    pub delivered: u64,
    pub elapsed_ms: u64,
    pub per_router: Vec<RouterReport>,
}

/// The running network.
pub struct Simulation {
    config: SimulationConfig,
    routers: Vec<SimRouter>,
    outbound: Vec<TunnelId>,
    inbound: Vec<(RouterHash, TunnelId)>,
    sent: usize,
    started: std::time::Instant,
}

impl Simulation {
    /// Start every router and build one outbound and one inbound tunnel per
    /// router.
    pub fn start(config: SimulationConfig, tunnel: TunnelConfig) -> anyhow::Result<Self> {
        let hashes: Vec<RouterHash> = (0..config.routers)
            .map(|i| RouterHash::from_bytes([i as u8 + 1; 32]))
            .collect();
        let channels: Vec<(Sender<Envelope>, Receiver<Envelope>)> =
            hashes.iter().map(|_| unbounded()).collect();
        let inboxes: Arc<HashMap<RouterHash, Sender<Envelope>>> = Arc::new(
            hashes
                .iter()
                .zip(&channels)
                .map(|(hash, (tx, _))| (*hash, tx.clone()))
                .collect(),
        );

        let mut routers = Vec::with_capacity(config.routers);
        for (hash, (tx, rx)) in hashes.iter().zip(channels) {
            let pool = Arc::new(CountingPool::default());
            let profiles = Arc::new(CountingProfiles::default());
            let ctx = RouterContext::builder(*hash)
                .outbound(Arc::new(ChannelQueue {
                    from: *hash,
                    inboxes: inboxes.clone(),
                }))
                .inbound(pool.clone())
                .profiles(profiles.clone())
                .config(tunnel.clone())
                .build()?;
            let dispatcher = TunnelDispatcher::new(ctx.clone())?;
            let thread = spawn_inbox(*hash, rx, dispatcher.clone(), pool.clone())?;
            routers.push(SimRouter {
                hash: *hash,
                ctx,
                dispatcher,
                pool,
                profiles,
                inbox: tx,
                thread: Some(thread),
            });
        }

        let mut sim = Self {
            config,
            routers,
            outbound: Vec::new(),
            inbound: Vec::new(),
            sent: 0,
            started: std::time::Instant::now(),
        };
        sim.build_tunnels()?;
        info!(
            routers = sim.routers.len(),
            hops = sim.config.hops,
            "simulated network ready"
        );
        Ok(sim)
    }

    fn build_tunnels(&mut self) -> anyhow::Result<()> {
        let mut rng = rand::thread_rng();
        for owner in 0..self.routers.len() {
            let out_path = self.random_path(owner, &mut rng);
            let cfg = self.generate(TunnelDirection::Outbound, owner, &out_path)?;
            self.routers[owner].dispatcher.join_outbound(&cfg)?;
            for (i, &node) in out_path.iter().enumerate().skip(1) {
                if let Some(hop) = cfg.hop_for_participant(i) {
                    let dispatcher = &self.routers[node].dispatcher;
                    if i == out_path.len() - 1 {
                        dispatcher.join_outbound_endpoint(hop)?;
                    } else {
                        dispatcher.join_participant(hop)?;
                    }
                }
            }
            let gateway = cfg
                .config(0)
                .and_then(|h| h.send_tunnel())
                .ok_or_else(|| anyhow::anyhow!("outbound tunnel without id"))?;
            self.outbound.push(gateway);

            let mut in_path = self.random_path(owner, &mut rng);
            in_path.rotate_left(1);
            let destination = *self.routers[owner].hash.as_bytes();
            let cfg = self
                .generate(TunnelDirection::Inbound, owner, &in_path)?
                .with_destination(destination);
            self.routers[owner].dispatcher.join_inbound(&cfg)?;
            for (i, &node) in in_path.iter().enumerate().take(in_path.len() - 1) {
                if let Some(hop) = cfg.hop_for_participant(i) {
                    let dispatcher = &self.routers[node].dispatcher;
                    if i == 0 {
                        dispatcher.join_inbound_gateway(hop)?;
                    } else {
                        dispatcher.join_participant(hop)?;
                    }
                }
            }
            let entry = cfg
                .config(0)
                .and_then(|h| h.receive_tunnel())
                .ok_or_else(|| anyhow::anyhow!("inbound tunnel without id"))?;
            let entry_router = self.routers[in_path[0]].hash;
            self.inbound.push((entry_router, entry));
            debug!(owner, outbound = ?out_path, inbound = ?in_path, "tunnels built");
        }
        Ok(())
    }

    /// `owner` followed by `hops` distinct other routers.
    fn random_path(&self, owner: usize, rng: &mut impl Rng) -> Vec<usize> {
        let mut others: Vec<usize> = (0..self.routers.len()).filter(|&i| i != owner).collect();
        others.shuffle(rng);
        std::iter::once(owner)
            .chain(others.into_iter().take(self.config.hops))
            .collect()
    }

    fn generate(
        &self,
        direction: TunnelDirection,
        owner: usize,
        path: &[usize],
    ) -> anyhow::Result<TunnelCreatorConfig> {
        let peers: Vec<RouterHash> = path.iter().map(|&i| self.routers[i].hash).collect();
        let now = self.routers[owner].ctx.now();
        Ok(TunnelCreatorConfig::generate(
            direction,
            self.routers[owner].hash,
            &peers,
            now,
            TUNNEL_LIFETIME_MS,
        )?)
    }

    /// Send the configured number of messages, each from a random router's
    /// outbound tunnel into another random router's inbound tunnel.
    pub fn send_traffic(&mut self) -> anyhow::Result<()> {
        let mut rng = rand::thread_rng();
        let n = self.routers.len();
        for _ in 0..self.config.messages {
            let from = rng.gen_range(0..n);
            let to = (from + rng.gen_range(1..n)) % n;
            let len = rng.gen_range(0..=self.config.max_message_size);
            let mut payload = vec![0u8; len];
            rng.fill(&mut payload[..]);
            let router = &self.routers[from];
            let message = TunnelMessage::new(MessageType::Data, payload, router.ctx.now() + MESSAGE_LIFETIME_MS);
            let (entry_router, entry_tunnel) = self.inbound[to];
            router
                .dispatcher
                .dispatch_outbound(message, self.outbound[from], Some(entry_tunnel), Some(entry_router))?;
            self.sent += 1;
        }
        info!(messages = self.sent, "traffic sent");
        Ok(())
    }

    /// Messages delivered so far across all routers.
    pub fn delivered(&self) -> u64 {
        self.routers
            .iter()
            .map(|r| r.pool.messages.load(Ordering::Relaxed))
            .sum()
    }

    /// Wait until every message arrived or `settle_ms` passed.
    pub fn settle(&self) {
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(self.config.settle_ms);
        while std::time::Instant::now() < deadline && self.delivered() < self.sent as u64 {
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
    }

    pub fn report(&self) -> SimulationReport {
        let per_router = self
            .routers
            .iter()
            .map(|r| RouterReport {
                router: r.hash.to_string(),
                delivered: r.pool.messages.load(Ordering::Relaxed),
                delivered_bytes: r.pool.bytes.load(Ordering::Relaxed),
                client_messages: r.pool.client_messages.load(Ordering::Relaxed),
                tunnels_joined: r.profiles.joined.load(Ordering::Relaxed),
                tunnels_rejected: r.profiles.rejected.load(Ordering::Relaxed),
                tunnels_expired: r.profiles.lifetimes.load(Ordering::Relaxed),
                fragments_lost: r.profiles.fragments_lost.load(Ordering::Relaxed),
                counts: r.dispatcher.counts(),
                stats: r.ctx.stats().snapshot(),
            })
            .collect();
        SimulationReport {
            routers: self.routers.len(),
            hops: self.config.hops,
            sent: self.sent,
            delivered: self.delivered(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            per_router,
        }
    }

    /// Stop pumps, inbox threads and timers.
    pub fn shutdown(&mut self) {
        for router in &self.routers {
            router.dispatcher.shutdown();
            let _ = router.inbox.send(Envelope::Stop);
        }
        for router in &mut self.routers {
            if let Some(thread) = router.thread.take() {
                let _ = thread.join();
            }
            router.ctx.timer().shutdown();
        }
        info!("simulated network stopped");
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        if self.routers.iter().any(|r| r.thread.is_some()) {
            self.shutdown();
        }
    }
}

fn spawn_inbox(
    hash: RouterHash,
    rx: Receiver<Envelope>,
    dispatcher: Arc<TunnelDispatcher>,
    pool: Arc<CountingPool>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("Inbox {hash}"))
        .spawn(move || {
            while let Ok(Envelope::Message { from, message }) = rx.recv() {
                if !dispatcher.receive(message.clone(), from) {
                    pool.add(message, None);
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hopnet_tunnel::config::BatchConfig;

    #[test]
    fn test_small_network_delivers_everything() {
        let config = SimulationConfig {
            routers: 4,
            hops: 1,
            messages: 20,
            max_message_size: 3_000,
            settle_ms: 10_000,
        };
        let tunnel = TunnelConfig {
            pump_threads: 2,
            batch: BatchConfig {
                delay_ms: 10,
                ..BatchConfig::default()
            },
            ..TunnelConfig::default()
        };
        let mut sim = Simulation::start(config, tunnel).expect("start");
        sim.send_traffic().expect("traffic");
        sim.settle();

        let report = sim.report();
        assert_eq!(report.sent, 20);
        assert_eq!(report.delivered, 20);
        let client: u64 = report.per_router.iter().map(|r| r.client_messages).sum();
        assert_eq!(client, 20);
        for r in &report.per_router {
            assert_eq!(r.stats.corrupt_cells, 0);
            assert_eq!(r.stats.replayed_cells, 0);
        }
        sim.shutdown();
    }
}
