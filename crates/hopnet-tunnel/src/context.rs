//! Per-router context.
//!
//! Every gateway, participant, endpoint and dispatcher is constructed with an
//! `Arc<RouterContext>` holding the router's identity, clock, timer, replay
//! oracle and the narrow interfaces to the rest of the router.

use std::sync::Arc;

use hopnet_replay::{BloomFilterIvValidator, IvValidator};
use hopnet_types::clock::{Clock, SystemClock};
use hopnet_types::identity::{RouterHash, TunnelId};
use hopnet_types::message::{TunnelDataMessage, TunnelMessage};
use hopnet_types::{Hash, CELL_SIZE};
use serde::Serialize;

use crate::config::TunnelConfig;
use crate::stats::{self, TunnelStats};
use crate::throttle::Location;
use crate::timer::SimpleTimer;
use crate::{Result, TunnelError};

/// Lifetime of a single cell in flight between two hops.
pub const TUNNEL_DATA_EXPIRATION_MS: u64 = 10_000;

/// Outbound network delivery queue.
///
/// Implementations must not block: gateways call this while holding their
/// queue lock.
pub trait OutboundQueue: Send + Sync {
    /// Queue `msg` for delivery to `peer`.
    fn send(&self, peer: RouterHash, msg: TunnelMessage);
}

/// Pool of fully reassembled messages addressed to this router.
pub trait InboundMessagePool: Send + Sync {
    /// Accept a message. `destination` is set for messages that arrived
    /// through a client tunnel.
    fn add(&self, msg: TunnelMessage, destination: Option<Hash>);
}

/// Events reported to the peer profile service.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum ProfileEvent {
    /// We joined a tunnel someone else built.
    TunnelJoined {
        tunnel: TunnelId,
        location: Location,
        previous: Option<RouterHash>,
    },
    /// A join was refused because the tunnel id was already in use.
    TunnelRejected { tunnel: TunnelId, location: Location },
    /// Bytes pushed to a neighbor.
    DataPushed { peer: RouterHash, bytes: u64 },
    /// A participating tunnel ended.
    TunnelLifetime {
        tunnel: TunnelId,
        previous: Option<RouterHash>,
        processed: u64,
        lifetime_ms: u64,
    },
    /// A partial message expired before its remaining fragments arrived.
    FragmentsLost { fragments: usize },
}

/// Peer profile service. Written to, never read.
pub trait ProfileSink: Send + Sync {
    fn record(&self, event: ProfileEvent);
}

/// Discards profile events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProfileSink;

impl ProfileSink for NoopProfileSink {
    fn record(&self, _event: ProfileEvent) {}
}

/// Collaborators and shared state for one router.
pub struct RouterContext {
    router_hash: RouterHash,
    started_at: u64,
    clock: Arc<dyn Clock>,
    timer: Arc<SimpleTimer>,
    validator: Arc<dyn IvValidator>,
    outbound: Arc<dyn OutboundQueue>,
    inbound: Arc<dyn InboundMessagePool>,
    profiles: Arc<dyn ProfileSink>,
    config: TunnelConfig,
    stats: Arc<TunnelStats>,
}

impl RouterContext {
    /// Start building a context for `router_hash`.
    pub fn builder(router_hash: RouterHash) -> RouterContextBuilder {
        RouterContextBuilder {
            router_hash,
            clock: None,
            timer: None,
            validator: None,
            outbound: None,
            inbound: None,
            profiles: None,
            config: TunnelConfig::default(),
        }
    }

    pub fn router_hash(&self) -> RouterHash {
        self.router_hash
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Milliseconds since this context was built.
    pub fn uptime(&self) -> u64 {
        self.now().saturating_sub(self.started_at)
    }

    /// Whether the router is past its startup grace period.
    pub fn past_startup_grace(&self) -> bool {
        self.uptime() > self.config.startup_grace_secs * 1000
    }

    pub fn timer(&self) -> &Arc<SimpleTimer> {
        &self.timer
    }

    pub fn validator(&self) -> &Arc<dyn IvValidator> {
        &self.validator
    }

    pub fn inbound(&self) -> &Arc<dyn InboundMessagePool> {
        &self.inbound
    }

    pub fn outbound(&self) -> &Arc<dyn OutboundQueue> {
        &self.outbound
    }

    pub fn profiles(&self) -> &Arc<dyn ProfileSink> {
        &self.profiles
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<TunnelStats> {
        &self.stats
    }

    /// Wrap `cell` in a TunnelData message for `tunnel` and queue it for
    /// `peer`. Returns the message id.
    pub fn send_cell(&self, peer: RouterHash, tunnel: TunnelId, cell: Box<[u8; CELL_SIZE]>) -> u32 {
        let msg = TunnelDataMessage::new(tunnel, cell)
            .into_message(self.now() + TUNNEL_DATA_EXPIRATION_MS);
        let id = msg.unique_id;
        let bytes = msg.size() as u64;
        self.outbound.send(peer, msg);
        stats::incr(&self.stats.cells_sent);
        self.profiles.record(ProfileEvent::DataPushed { peer, bytes });
        id
    }
}

/// Builder for [`RouterContext`].
pub struct RouterContextBuilder {
    router_hash: RouterHash,
    clock: Option<Arc<dyn Clock>>,
    timer: Option<Arc<SimpleTimer>>,
    validator: Option<Arc<dyn IvValidator>>,
    outbound: Option<Arc<dyn OutboundQueue>>,
    inbound: Option<Arc<dyn InboundMessagePool>>,
    profiles: Option<Arc<dyn ProfileSink>>,
    config: TunnelConfig,
}

impl RouterContextBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn timer(mut self, timer: Arc<SimpleTimer>) -> Self {
        self.timer = Some(timer);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn IvValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn outbound(mut self, queue: Arc<dyn OutboundQueue>) -> Self {
        self.outbound = Some(queue);
        self
    }

    pub fn inbound(mut self, pool: Arc<dyn InboundMessagePool>) -> Self {
        self.inbound = Some(pool);
        self
    }

    pub fn profiles(mut self, sink: Arc<dyn ProfileSink>) -> Self {
        self.profiles = Some(sink);
        self
    }

    pub fn config(mut self, config: TunnelConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the context. The clock defaults to the system clock, the timer
    /// to a threaded timer, and the validator to a Bloom-filter validator.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::Config`] if the outbound queue or inbound pool is missing
    pub fn build(self) -> Result<Arc<RouterContext>> {
        let outbound = self
            .outbound
            .ok_or_else(|| TunnelError::Config("outbound queue not set".into()))?;
        let inbound = self
            .inbound
            .ok_or_else(|| TunnelError::Config("inbound pool not set".into()))?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let timer = match self.timer {
            Some(timer) => timer,
            None => SimpleTimer::start(clock.clone())?,
        };
        let validator: Arc<dyn IvValidator> = match self.validator {
            Some(v) => v,
            None => Arc::new(BloomFilterIvValidator::new(clock.clone())?),
        };
        Ok(Arc::new(RouterContext {
            router_hash: self.router_hash,
            started_at: clock.now(),
            clock,
            timer,
            validator,
            outbound,
            inbound,
            profiles: self.profiles.unwrap_or_else(|| Arc::new(NoopProfileSink)),
            config: self.config,
            stats: Arc::new(TunnelStats::default()),
        }))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Capturing collaborators and a deterministic context for unit tests.

    use std::sync::Mutex;

    use hopnet_replay::BloomFilterIvValidator;
    use hopnet_types::clock::ManualClock;

    use super::*;

    #[derive(Default)]
    pub struct CaptureQueue(pub Mutex<Vec<(RouterHash, TunnelMessage)>>);

    impl CaptureQueue {
        pub fn take(&self) -> Vec<(RouterHash, TunnelMessage)> {
            std::mem::take(&mut *self.0.lock().expect("lock"))
        }
    }

    impl OutboundQueue for CaptureQueue {
        fn send(&self, peer: RouterHash, msg: TunnelMessage) {
            self.0.lock().expect("lock").push((peer, msg));
        }
    }

    #[derive(Default)]
    pub struct CapturePool(pub Mutex<Vec<(TunnelMessage, Option<Hash>)>>);

    impl CapturePool {
        pub fn take(&self) -> Vec<(TunnelMessage, Option<Hash>)> {
            std::mem::take(&mut *self.0.lock().expect("lock"))
        }
    }

    impl InboundMessagePool for CapturePool {
        fn add(&self, msg: TunnelMessage, destination: Option<Hash>) {
            self.0.lock().expect("lock").push((msg, destination));
        }
    }

    #[derive(Default)]
    pub struct CaptureProfiles(pub Mutex<Vec<ProfileEvent>>);

    impl ProfileSink for CaptureProfiles {
        fn record(&self, event: ProfileEvent) {
            self.0.lock().expect("lock").push(event);
        }
    }

    pub struct TestRouter {
        pub ctx: Arc<RouterContext>,
        pub clock: Arc<ManualClock>,
        pub outbound: Arc<CaptureQueue>,
        pub inbound: Arc<CapturePool>,
        pub profiles: Arc<CaptureProfiles>,
    }

    pub fn hash(b: u8) -> RouterHash {
        RouterHash::from_bytes([b; 32])
    }

    /// Router `[b; 32]` with a manual clock at 1 000 000 ms, a manual timer
    /// and inline pumping.
    pub fn router(b: u8) -> TestRouter {
        let config = TunnelConfig {
            pump_threads: 0,
            ..TunnelConfig::default()
        };
        router_with_config(b, config)
    }

    pub fn router_with_config(b: u8, config: TunnelConfig) -> TestRouter {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let outbound = Arc::new(CaptureQueue::default());
        let inbound = Arc::new(CapturePool::default());
        let profiles = Arc::new(CaptureProfiles::default());
        let validator =
            BloomFilterIvValidator::with_params(16, 600_000, clock.clone()).expect("validator");
        let ctx = RouterContext::builder(hash(b))
            .clock(clock.clone())
            .timer(SimpleTimer::manual(clock.clone()))
            .validator(Arc::new(validator))
            .outbound(outbound.clone())
            .inbound(inbound.clone())
            .profiles(profiles.clone())
            .config(config)
            .build()
            .expect("context");
        TestRouter {
            ctx,
            clock,
            outbound,
            inbound,
            profiles,
        }
    }
}
