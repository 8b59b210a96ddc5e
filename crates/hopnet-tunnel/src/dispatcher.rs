//! Tunnel id routing table and participation lifecycle.
//!
//! One [`TunnelDispatcher`] per router maps tunnel ids to local handlers:
//!
//! | Map | Holds | Keyed by |
//! |---|---|---|
//! | outbound gateways | gateways of outbound tunnels we created | hop 0 send tunnel |
//! | outbound endpoints | endpoints of other routers' outbound tunnels | receive tunnel |
//! | participants | middle hops, and endpoints of our inbound tunnels | receive tunnel |
//! | inbound gateways | our zero-hop inbound tunnels, and foreign inbound gateways | receive tunnel |
//! | participating | every hop we did not create | receive tunnel |
//!
//! Foreign joins are appended to a leave queue in join order. Since build
//! lifetimes are roughly uniform the queue is close to expiration order, so
//! one timer event for its head is enough.
//!
//! The maps are `DashMap`s: lookups from pump and network threads take a
//! shard read lock while joins and leaves are rare.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hopnet_types::identity::{RouterHash, TunnelId};
use hopnet_types::message::{MessageType, TunnelDataMessage, TunnelGatewayMessage, TunnelMessage};
use hopnet_types::tunnel::{HopConfig, TunnelCreatorConfig};
use hopnet_types::CLOCK_FUDGE_MS;
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::context::{ProfileEvent, RouterContext};
use crate::endpoint::OutboundTunnelEndpoint;
use crate::gateway::{
    Gateway, GatewaySender, NextHopReceiver, PumpedTunnelGateway, TunnelGatewayPumper, ZeroHopGateway,
};
use crate::participant::TunnelParticipant;
use crate::stats;
use crate::throttle::{Location, ParticipatingThrottle};
use crate::timer::TimerHandle;
use crate::{Result, TunnelError};

/// A hop we serve in someone else's tunnel.
#[derive(Clone)]
pub struct Participation {
    pub hop: Arc<HopConfig>,
    pub location: Location,
}

/// Number of handlers in each map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherCounts {
    pub outbound_gateways: usize,
    pub outbound_endpoints: usize,
    pub participants: usize,
    pub inbound_gateways: usize,
    pub participating: usize,
}

struct LeaveEntry {
    drop_at: u64,
    tunnel_id: TunnelId,
    hop: Arc<HopConfig>,
}

#[derive(Default)]
struct LeaveQueue {
    entries: VecDeque<LeaveEntry>,
    scheduled: Option<TimerHandle>,
}

/// Routes cells and gateway messages to the handler for their tunnel id.
pub struct TunnelDispatcher {
    this: Weak<TunnelDispatcher>,
    ctx: Arc<RouterContext>,
    pumper: Arc<TunnelGatewayPumper>,
    throttle: Arc<ParticipatingThrottle>,
    outbound_gateways: DashMap<TunnelId, Arc<dyn Gateway>>,
    outbound_endpoints: DashMap<TunnelId, Arc<OutboundTunnelEndpoint>>,
    participants: DashMap<TunnelId, Arc<TunnelParticipant>>,
    inbound_gateways: DashMap<TunnelId, Arc<dyn Gateway>>,
    participating: DashMap<TunnelId, Participation>,
    leave: Mutex<LeaveQueue>,
    last_participating_expiration: AtomicU64,
}

impl TunnelDispatcher {
    /// Build the dispatcher and start `config.pump_threads` pump workers.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::Io`] if a pump thread cannot be spawned
    pub fn new(ctx: Arc<RouterContext>) -> Result<Arc<Self>> {
        let pumper = TunnelGatewayPumper::new(ctx.config().pump_threads)?;
        let throttle = Arc::new(ParticipatingThrottle::new(
            &ctx.config().bandwidth,
            ctx.clock().clone(),
            ctx.stats().clone(),
        ));
        info!(
            router = %ctx.router_hash(),
            pump_threads = ctx.config().pump_threads,
            "tunnel dispatcher started"
        );
        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            ctx,
            pumper,
            throttle,
            outbound_gateways: DashMap::new(),
            outbound_endpoints: DashMap::new(),
            participants: DashMap::new(),
            inbound_gateways: DashMap::new(),
            participating: DashMap::new(),
            leave: Mutex::new(LeaveQueue::default()),
            last_participating_expiration: AtomicU64::new(0),
        }))
    }

    pub fn context(&self) -> &Arc<RouterContext> {
        &self.ctx
    }

    pub fn throttle(&self) -> &Arc<ParticipatingThrottle> {
        &self.throttle
    }

    // ---- tunnels we created ----

    /// Install the gateway of an outbound tunnel we built. Returns `false` if
    /// its tunnel id is already taken.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::Config`] if the tunnel has no usable first hop
    pub fn join_outbound(&self, cfg: &TunnelCreatorConfig) -> Result<bool> {
        let hop = first_hop(cfg)?;
        let tunnel_id = hop
            .send_tunnel()
            .ok_or_else(|| TunnelError::Config("outbound tunnel has no send tunnel id".into()))?;
        let joined = match self.outbound_gateways.entry(tunnel_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let gateway: Arc<dyn Gateway> = if cfg.length() == 1 {
                    Arc::new(ZeroHopGateway::outbound(self.ctx.clone(), cfg, self.this.clone())?)
                } else {
                    PumpedTunnelGateway::new(
                        self.ctx.clone(),
                        tunnel_id,
                        Box::new(GatewaySender::outbound(cfg)),
                        Box::new(NextHopReceiver::new(self.ctx.clone(), hop.clone())?),
                        self.pumper.clone(),
                    )
                };
                slot.insert(gateway);
                true
            }
        };
        if joined {
            debug!(tunnel = %tunnel_id, hops = cfg.length(), "joined outbound tunnel");
        } else {
            warn!(tunnel = %tunnel_id, "outbound tunnel id already in use");
        }
        Ok(joined)
    }

    /// Install the receiving end of an inbound tunnel we built. Returns
    /// `false` if its tunnel id is already taken.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::Config`] if the tunnel has no receive tunnel id
    pub fn join_inbound(&self, cfg: &TunnelCreatorConfig) -> Result<bool> {
        let (tunnel_id, joined) = if cfg.length() == 1 {
            let gateway = ZeroHopGateway::inbound(self.ctx.clone(), cfg, self.this.clone())?;
            let tunnel_id = gateway.tunnel_id();
            (tunnel_id, insert_new(&self.inbound_gateways, tunnel_id, || Ok(Arc::new(gateway) as Arc<dyn Gateway>))?)
        } else {
            let endpoint = TunnelParticipant::inbound_endpoint(self.ctx.clone(), cfg, self.this.clone())?;
            let tunnel_id = endpoint.tunnel_id();
            (tunnel_id, insert_new(&self.participants, tunnel_id, || Ok(Arc::new(endpoint)))?)
        };
        if joined {
            debug!(tunnel = %tunnel_id, hops = cfg.length(), "joined inbound tunnel");
        } else {
            warn!(tunnel = %tunnel_id, "inbound tunnel id already in use");
        }
        Ok(joined)
    }

    /// Remove every handler of a tunnel we created. Returns `false` if none
    /// was installed.
    pub fn remove_created(&self, cfg: &TunnelCreatorConfig) -> bool {
        let Some(hop) = cfg.config(0) else {
            return false;
        };
        let removed = if cfg.is_inbound() {
            if cfg.length() == 1 {
                hop.receive_tunnel()
                    .is_some_and(|id| self.inbound_gateways.remove(&id).is_some())
            } else {
                cfg.config(cfg.length() - 1)
                    .and_then(|last| last.receive_tunnel())
                    .is_some_and(|id| {
                        self.participants
                            .remove_if(&id, |_, p| p.is_inbound_endpoint())
                            .is_some()
                    })
            }
        } else {
            hop.send_tunnel()
                .is_some_and(|id| self.outbound_gateways.remove(&id).is_some())
        };
        if removed {
            debug!(inbound = cfg.is_inbound(), hops = cfg.length(), "removed created tunnel");
        }
        removed
    }

    // ---- tunnels we participate in ----

    /// Serve as a middle hop. Returns `false` on a duplicate tunnel id.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::Config`] if the hop lacks ids or a next hop
    pub fn join_participant(&self, hop: HopConfig) -> Result<bool> {
        let hop = Arc::new(hop);
        let throttle = self.throttle.clone();
        self.join_foreign(hop.clone(), Location::Participant, &self.participants, || {
            Ok(Arc::new(TunnelParticipant::forwarding(self.ctx.clone(), hop, throttle)?))
        })
    }

    /// Serve as the endpoint of someone's outbound tunnel. Returns `false`
    /// on a duplicate tunnel id.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::Config`] if the hop has no receive tunnel id
    pub fn join_outbound_endpoint(&self, hop: HopConfig) -> Result<bool> {
        let hop = Arc::new(hop);
        let throttle = self.throttle.clone();
        self.join_foreign(hop.clone(), Location::OutboundEndpoint, &self.outbound_endpoints, || {
            Ok(Arc::new(OutboundTunnelEndpoint::new(
                self.ctx.clone(),
                hop,
                throttle,
                self.this.clone(),
            )?))
        })
    }

    /// Serve as the gateway of someone's inbound tunnel. Returns `false` on a
    /// duplicate tunnel id.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::Config`] if the hop lacks ids or a next hop
    pub fn join_inbound_gateway(&self, hop: HopConfig) -> Result<bool> {
        let hop = Arc::new(hop);
        self.join_foreign(hop.clone(), Location::InboundGateway, &self.inbound_gateways, || {
            let tunnel_id = hop
                .receive_tunnel()
                .ok_or_else(|| TunnelError::Config("inbound gateway has no tunnel id".into()))?;
            let gateway: Arc<dyn Gateway> = PumpedTunnelGateway::throttled(
                self.ctx.clone(),
                tunnel_id,
                Box::new(GatewaySender::inbound(&hop)),
                Box::new(NextHopReceiver::new(self.ctx.clone(), hop.clone())?),
                self.pumper.clone(),
                self.throttle.clone(),
                hop.clone(),
            );
            Ok(gateway)
        })
    }

    /// Stop serving a hop of someone else's tunnel, keyed by its receive
    /// tunnel id. Returns `false` if we were not serving it.
    pub fn remove_participating(&self, hop: &HopConfig) -> bool {
        let Some(tunnel_id) = hop.receive_tunnel() else {
            return false;
        };
        match self.participating.remove(&tunnel_id) {
            Some((_, participation)) => {
                self.leave_role(tunnel_id, &participation);
                true
            }
            None => false,
        }
    }

    /// Hops served for other routers.
    pub fn participating_count(&self) -> usize {
        self.participating.len()
    }

    /// Latest expiration of any hop joined for another router.
    pub fn last_participating_expiration(&self) -> u64 {
        self.last_participating_expiration.load(Ordering::Relaxed)
    }

    pub fn counts(&self) -> DispatcherCounts {
        DispatcherCounts {
            outbound_gateways: self.outbound_gateways.len(),
            outbound_endpoints: self.outbound_endpoints.len(),
            participants: self.participants.len(),
            inbound_gateways: self.inbound_gateways.len(),
            participating: self.participating.len(),
        }
    }

    /// Drop every participating hop whose leave time has passed. Returns how
    /// many were removed.
    pub fn expire_participating(&self, now: u64) -> usize {
        let due: Vec<LeaveEntry> = {
            let mut leave = self.leave();
            let mut due = Vec::new();
            while leave.entries.front().is_some_and(|e| e.drop_at <= now) {
                if let Some(entry) = leave.entries.pop_front() {
                    due.push(entry);
                }
            }
            self.schedule_leave(&mut leave);
            due
        };
        let mut removed = 0;
        for entry in due {
            let participation = self
                .participating
                .remove_if(&entry.tunnel_id, |_, p| Arc::ptr_eq(&p.hop, &entry.hop));
            if let Some((_, participation)) = participation {
                self.leave_role(entry.tunnel_id, &participation);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, remaining = self.participating.len(), "expired participating tunnels");
        }
        removed
    }

    // ---- traffic ----

    /// Network entry point. Returns `false` for messages that are not tunnel
    /// traffic, which the caller should deliver elsewhere.
    pub fn receive(&self, msg: TunnelMessage, from: RouterHash) -> bool {
        match msg.kind {
            MessageType::TunnelData => match TunnelDataMessage::from_message(&msg) {
                Ok(data) => self.dispatch(data, from),
                Err(e) => {
                    stats::incr(&self.ctx.stats().corrupt_cells);
                    warn!(peer = %from, error = %e, "undecodable tunnel data message");
                }
            },
            MessageType::TunnelGateway => match TunnelGatewayMessage::from_message(&msg) {
                Ok(gateway) => self.dispatch_gateway(gateway),
                Err(e) => {
                    stats::incr(&self.ctx.stats().corrupt_cells);
                    warn!(peer = %from, error = %e, "undecodable tunnel gateway message");
                }
            },
            kind => {
                trace!(peer = %from, ?kind, "not tunnel traffic");
                return false;
            }
        }
        true
    }

    /// Route a cell to the participant or outbound endpoint for its tunnel.
    pub fn dispatch(&self, msg: TunnelDataMessage, from: RouterHash) {
        let tunnel_id = msg.tunnel_id;
        let participant = self.participants.get(&tunnel_id).map(|p| p.value().clone());
        if let Some(participant) = participant {
            participant.dispatch(msg.data, &from);
            return;
        }
        let endpoint = self.outbound_endpoints.get(&tunnel_id).map(|e| e.value().clone());
        if let Some(endpoint) = endpoint {
            endpoint.dispatch(msg.data, &from);
            return;
        }
        self.unknown_tunnel(tunnel_id, Some(from));
    }

    /// Hand a message to the inbound gateway for its tunnel.
    pub fn dispatch_gateway(&self, msg: TunnelGatewayMessage) {
        let tunnel_id = msg.tunnel_id;
        if let Err(e) = self.check_expiration(&msg.message) {
            warn!(tunnel = %tunnel_id, message_id = msg.message.unique_id, error = %e, "dropping expired gateway message");
            return;
        }
        let gateway = self.inbound_gateways.get(&tunnel_id).map(|g| g.value().clone());
        match gateway {
            Some(gateway) => {
                if let Err(e) = gateway.add(msg.message, None, None) {
                    warn!(tunnel = %tunnel_id, error = %e, "inbound gateway refused message");
                }
            }
            None => self.unknown_tunnel(tunnel_id, None),
        }
    }

    /// Send a locally originated message down one of our outbound tunnels,
    /// to `to_router` (and `to_tunnel` there) after the endpoint.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::Expired`] if `msg` expired more than the clock fudge ago
    /// - [`TunnelError::UnknownTunnel`] if `outbound_tunnel` is not ours
    /// - [`TunnelError::MessageTooLarge`] if `msg` exceeds the fragment limit
    pub fn dispatch_outbound(
        &self,
        msg: TunnelMessage,
        outbound_tunnel: TunnelId,
        to_tunnel: Option<TunnelId>,
        to_router: Option<RouterHash>,
    ) -> Result<()> {
        if let Err(e) = self.check_expiration(&msg) {
            warn!(tunnel = %outbound_tunnel, message_id = msg.unique_id, "dropping expired outbound message");
            return Err(e);
        }
        let gateway = self.outbound_gateways.get(&outbound_tunnel).map(|g| g.value().clone());
        match gateway {
            Some(gateway) => gateway.add(msg, to_router, to_tunnel),
            None => {
                self.unknown_tunnel(outbound_tunnel, None);
                Err(TunnelError::UnknownTunnel(outbound_tunnel))
            }
        }
    }

    /// Stop pumping and cancel the leave job. Installed handlers stay until
    /// the dispatcher is dropped.
    pub fn shutdown(&self) {
        if let Some(handle) = self.leave().scheduled.take() {
            self.ctx.timer().cancel(handle);
        }
        self.pumper.shutdown();
        info!(router = %self.ctx.router_hash(), "tunnel dispatcher stopped");
    }

    // ---- internals ----

    fn join_foreign<T, F>(
        &self,
        hop: Arc<HopConfig>,
        location: Location,
        map: &DashMap<TunnelId, T>,
        make: F,
    ) -> Result<bool>
    where
        F: FnOnce() -> Result<T>,
    {
        let tunnel_id = hop
            .receive_tunnel()
            .ok_or_else(|| TunnelError::Config("participating hop has no receive tunnel id".into()))?;
        // Participating entry first, then the role map, so the pair is
        // installed together or not at all.
        let joined = match self.participating.entry(tunnel_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let joined = insert_new(map, tunnel_id, make)?;
                if joined {
                    slot.insert(Participation {
                        hop: hop.clone(),
                        location,
                    });
                }
                joined
            }
        };

        if !joined {
            warn!(tunnel = %tunnel_id, ?location, "duplicate participating tunnel id");
            self.ctx.profiles().record(ProfileEvent::TunnelRejected {
                tunnel: tunnel_id,
                location,
            });
            return Ok(false);
        }
        debug!(tunnel = %tunnel_id, ?location, "joined participating tunnel");
        self.ctx.profiles().record(ProfileEvent::TunnelJoined {
            tunnel: tunnel_id,
            location,
            previous: hop.receive_from(),
        });
        self.last_participating_expiration
            .fetch_max(hop.expiration(), Ordering::Relaxed);

        let mut leave = self.leave();
        leave.entries.push_back(LeaveEntry {
            drop_at: hop.expiration().saturating_add(2 * CLOCK_FUDGE_MS),
            tunnel_id,
            hop,
        });
        self.schedule_leave(&mut leave);
        Ok(true)
    }

    fn leave_role(&self, tunnel_id: TunnelId, participation: &Participation) {
        match participation.location {
            Location::Participant => {
                self.participants
                    .remove_if(&tunnel_id, |_, p| Arc::ptr_eq(p.config(), &participation.hop));
            }
            Location::OutboundEndpoint => {
                self.outbound_endpoints
                    .remove_if(&tunnel_id, |_, e| Arc::ptr_eq(e.config(), &participation.hop));
            }
            Location::InboundGateway => {
                self.inbound_gateways.remove(&tunnel_id);
            }
        }
        let hop = &participation.hop;
        self.ctx.profiles().record(ProfileEvent::TunnelLifetime {
            tunnel: tunnel_id,
            previous: hop.receive_from(),
            processed: hop.processed_messages(),
            lifetime_ms: hop.expiration().saturating_sub(hop.creation()),
        });
        trace!(tunnel = %tunnel_id, processed = hop.processed_messages(), "left participating tunnel");
    }

    /// Arm the leave timer for the queue head if none is armed.
    fn schedule_leave(&self, leave: &mut LeaveQueue) {
        if leave.scheduled.is_some() {
            return;
        }
        let Some(head) = leave.entries.front() else {
            return;
        };
        let delay = head.drop_at.saturating_sub(self.ctx.now());
        let this = self.this.clone();
        leave.scheduled = Some(self.ctx.timer().schedule(delay, move || {
            if let Some(dispatcher) = this.upgrade() {
                dispatcher.leave().scheduled = None;
                let now = dispatcher.ctx.now();
                dispatcher.expire_participating(now);
            }
        }));
    }

    fn check_expiration(&self, msg: &TunnelMessage) -> Result<()> {
        let now = self.ctx.now();
        if msg.expiration.saturating_add(CLOCK_FUDGE_MS) < now {
            stats::incr(&self.ctx.stats().expired_messages);
            return Err(TunnelError::Expired(now - msg.expiration));
        }
        Ok(())
    }

    fn unknown_tunnel(&self, tunnel_id: TunnelId, from: Option<RouterHash>) {
        stats::incr(&self.ctx.stats().unknown_tunnel);
        let from = from.map(|p| p.to_string());
        if self.ctx.past_startup_grace() {
            error!(tunnel = %tunnel_id, peer = ?from, "no handler for tunnel, clock skew or stale route?");
        } else {
            warn!(tunnel = %tunnel_id, peer = ?from, "no handler for tunnel");
        }
    }

    fn leave(&self) -> MutexGuard<'_, LeaveQueue> {
        self.leave.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn first_hop(cfg: &TunnelCreatorConfig) -> Result<Arc<HopConfig>> {
    cfg.config(0)
        .cloned()
        .ok_or_else(|| TunnelError::Config("empty tunnel".into()))
}

/// Insert `make()` under `id` unless the id is taken.
fn insert_new<T, F>(map: &DashMap<TunnelId, T>, id: TunnelId, make: F) -> Result<bool>
where
    F: FnOnce() -> Result<T>,
{
    match map.entry(id) {
        Entry::Occupied(_) => Ok(false),
        Entry::Vacant(slot) => {
            slot.insert(make()?);
            Ok(true)
        }
    }
}
