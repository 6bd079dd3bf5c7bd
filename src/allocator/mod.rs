//! The allocator actor of one peer.
//!
//! It owns the ring replica, the free space inside the ranges this peer
//! owns, the persisted allocations, and the queue of requests that are
//! waiting for space. Everything runs on one task; requests that can't be
//! answered yet are parked and looked at again after every message.

mod handle;
mod ops;
mod persistence;

pub use handle::{AllocatorHandle, Command, spawn};
pub use ops::CancelSignal;

use crate::address::{Address, AddressError, Cidr, Count, Range};
use crate::config::{Config, Mode};
use crate::gossip::{self, Gossip, GossipMessage};
use crate::paxos::{Node, Outbound, PaxosMessage};
use crate::peer::PeerName;
use crate::ring::{RangeInfo, Ring, RingState};
use crate::space::{Space, SpaceError};
use crate::store::Store;
use crate::tracker::{self, RangeTracker};
use anyhow::Context;
use itertools::Itertools;
use ops::{AllocateOp, ClaimOp, Operation};
use persistence::PersistedState;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::{Duration, Instant};

macro_rules! log_as {
    ($level:ident, $alloc:expr, $($arg:tt)+) => {
        log::$level!("[allocator {}] {}", $alloc.our_name, format_args!($($arg)+))
    };
}

/// What callers of the allocator can get back instead of an answer.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("invalid subnet {0}: {1}")]
    InvalidSubnet(Cidr, AddressError),
    #[error("subnet {subnet} is outside the universe {universe}")]
    SubnetOutsideUniverse { subnet: Cidr, universe: Cidr },
    #[error("address {addr} is outside the universe {universe}")]
    NotInUniverse { addr: Address, universe: Cidr },
    #[error("no free addresses in {0}")]
    NoFreeSpace(Cidr),
    #[error("timed out claiming {0}")]
    Timeout(Address),
    #[error("address {addr} is already in use by {holder}")]
    AddressInUse { addr: Address, holder: String },
    #[error("address {addr} is owned by {owner}, which refused to give it up")]
    AddressOwnedElsewhere { addr: Address, owner: PeerName },
    #[error("cannot reach {owner}, the owner of {addr}")]
    OwnerUnreachable { addr: Address, owner: PeerName },
    #[error("no address {addr} recorded for {identity}")]
    NotFound { identity: String, addr: Address },
    #[error("cannot remove ourselves from the ring")]
    RemoveSelf,
    #[error("invalid peer name '{0}'")]
    InvalidPeer(String),
    #[error("rejected gossip: {0}")]
    Gossip(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("allocator is shutting down")]
    ShuttingDown,
    #[error("allocator has stopped")]
    Stopped,
    #[error("failed to persist state: {0}")]
    Store(String),
    #[error("range tracker failed: {0}")]
    Tracker(String),
    #[error(transparent)]
    Space(#[from] SpaceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AllocatorState {
    /// No ring yet, nothing happening
    Priming,
    Electing,
    Established,
    Observer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectionStatus {
    pub quorum: u32,
    pub known_peers: Vec<PeerName>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub name: PeerName,
    pub nickname: Option<String>,
    pub state: AllocatorState,
    pub universe: Cidr,
    pub default_subnet: Cidr,
    pub entries: Vec<RangeInfo>,
    pub owned_ranges: Vec<Range>,
    pub free: Count,
    pub allocated: Count,
    pub pending_ops: usize,
    pub election: Option<ElectionStatus>,
}

/// Addresses held by one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owned {
    pub is_container: bool,
    pub cidrs: Vec<Cidr>,
}

/// An address the container runtime reports as already in use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreClaim {
    pub identity: String,
    pub cidr: Cidr,
}

pub struct Allocator {
    config: Config,
    our_name: PeerName,
    ring: Ring,
    space: Space,
    paxos: Option<Node>,
    owned: BTreeMap<String, Owned>,
    nicknames: BTreeMap<PeerName, String>,
    dead: BTreeMap<String, Instant>,
    pending: VecDeque<Operation>,
    store: Box<dyn Store>,
    gossip: Box<dyn Gossip>,
    tracker: Option<Box<dyn RangeTracker>>,
    /// Set by ring changes, so parked requests ask donors again
    ring_changed: bool,
    ring_requested: bool,
    stopped: bool,
}

impl Allocator {
    pub fn new(
        config: Config,
        store: Box<dyn Store>,
        gossip: Box<dyn Gossip>,
        tracker: Option<Box<dyn RangeTracker>>,
    ) -> Self {
        let our_name = config.our_name.clone();
        let mut nicknames = BTreeMap::new();
        if let Some(nickname) = &config.our_nickname {
            nicknames.insert(our_name.clone(), nickname.clone());
        }

        Self {
            ring: Ring::new(config.universe.range(), our_name.clone()),
            space: Space::new(),
            paxos: None,
            owned: BTreeMap::new(),
            nicknames,
            dead: BTreeMap::new(),
            pending: VecDeque::new(),
            store,
            gossip,
            tracker,
            ring_changed: false,
            ring_requested: false,
            stopped: false,
            config,
            our_name,
        }
    }

    pub fn name(&self) -> &PeerName {
        &self.our_name
    }

    pub fn tick_interval(&self) -> Duration {
        self.config.tick_interval
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    pub fn space(&self) -> &Space {
        &self.space
    }

    pub fn state(&self) -> AllocatorState {
        if self.config.is_observer() {
            AllocatorState::Observer
        } else if !self.ring.is_empty() {
            AllocatorState::Established
        } else if self.paxos.as_ref().is_some_and(Node::is_proposing) {
            AllocatorState::Electing
        } else {
            AllocatorState::Priming
        }
    }

    /// Loads persisted state, builds the initial ring in seed mode and
    /// reconciles the addresses the runtime says are in use.
    pub fn start(&mut self, preclaims: Vec<PreClaim>) -> anyhow::Result<()> {
        let universe = self.config.universe.range();
        match persistence::load(&*self.store, &self.our_name, universe)? {
            Some(state) => {
                if let Mode::Seed(_) = self.config.mode {
                    log_as!(info, self, "found persisted IPAM data, ignoring supplied seed");
                }
                let ring = Ring::restore(self.our_name.clone(), state.ring_state())
                    .context("restoring persisted ring")?;
                let owned_ranges = ring.owned_ranges();
                if let Some(hook) = self.tracker.as_deref_mut() {
                    tracker::apply(hook, &tracker::transitions(&[], &owned_ranges))
                        .context("range tracker refused persisted ranges")?;
                }

                self.owned = state.owned()?;
                for (peer, nickname) in state.nicknames {
                    self.nicknames.entry(peer).or_insert(nickname);
                }
                self.ring = ring;
                self.space.update_ranges(&owned_ranges);
                self.restore_allocations();
                log_as!(
                    info,
                    self,
                    "restored a ring of {} entries and {} allocations",
                    self.ring.entries().len(),
                    self.space.num_allocated()
                );
            }
            None => {
                if let Mode::Seed(seeds) = self.config.mode.clone() {
                    self.create_ring(&seeds)?;
                }
            }
        }

        if matches!(self.config.mode, Mode::Consensus(_)) && self.ring.is_empty() {
            self.paxos = Some(Node::new(self.our_name.clone(), self.config.quorum()));
        }

        self.reconcile(preclaims);
        self.persist()?;
        self.after_step();
        log_as!(info, self, "started, state {}", self.state());
        Ok(())
    }

    /// Runs one command to completion. Requests that need space from other
    /// peers are parked instead.
    pub fn handle(&mut self, command: Command, now: Instant) {
        if self.stopped {
            command.reject(AllocError::ShuttingDown);
            return;
        }

        match command {
            Command::Allocate {
                identity,
                subnet,
                is_container,
                cancel,
                responder,
            } => {
                let subnet = subnet.unwrap_or(self.config.default_subnet);
                if let Err(e) = self.check_subnet(subnet) {
                    let _ = responder.send(Err(e));
                } else {
                    self.enqueue(Operation::Allocate(AllocateOp {
                        identity,
                        subnet,
                        is_container,
                        deadline: now + self.config.request_timeout,
                        cancel,
                        responder,
                        asked: BTreeSet::new(),
                        awaiting: None,
                    }));
                }
            }
            Command::Lookup {
                identity,
                subnet,
                responder,
            } => {
                let subnet = subnet.unwrap_or(self.config.default_subnet);
                let _ = responder.send(Ok(self.addresses_of(&identity, subnet)));
            }
            Command::Claim {
                identity,
                cidr,
                is_container,
                no_error_on_unknown,
                cancel,
                responder,
            } => self.enqueue(Operation::Claim(ClaimOp {
                identity,
                cidr,
                is_container,
                no_error_on_unknown,
                preclaim: false,
                deadline: Some(now + self.config.request_timeout),
                cancel,
                responder: Some(responder),
                requested_from: None,
                denied_by: None,
            })),
            Command::Free {
                identity,
                addr,
                responder,
            } => {
                let _ = responder.send(self.free(&identity, addr));
            }
            Command::Delete {
                identity,
                responder,
            } => {
                let _ = responder.send(self.delete(&identity));
            }
            Command::ContainerDied { identity } => self.container_died(&identity, now),
            Command::ContainerStarted { identity } => {
                if self.dead.remove(&identity).is_some() {
                    log_as!(debug, self, "container {identity} came back");
                }
            }
            Command::PruneOwned { live, responder } => {
                let _ = responder.send(self.prune_owned(&live));
            }
            Command::AdminRmPeer { peer, responder } => {
                let _ = responder.send(self.admin_rm_peer(&peer));
            }
            Command::GossipReceived {
                sender,
                bytes,
                responder,
            } => {
                let result = self.on_gossip(&sender, &bytes);
                if let Err(e) = &result {
                    log_as!(warn, self, "dropped gossip from {sender}: {e}");
                }
                let _ = responder.send(result);
            }
            Command::PeerGone { peer } => self.peer_gone(&peer),
            Command::Status { responder } => {
                let _ = responder.send(Ok(self.status()));
            }
            Command::Shutdown { responder } => {
                self.shutdown();
                let _ = responder.send(Ok(()));
                return;
            }
        }

        self.after_step();
    }

    /// Periodic housekeeping: election retries, anti-entropy gossip,
    /// timeouts and dead containers.
    pub fn tick(&mut self, now: Instant) {
        if self.stopped {
            return;
        }

        if self.ring.is_empty() {
            self.ring_requested = false;
            self.retry_election();
        } else {
            self.broadcast_ring();
        }

        self.expire_ops(now);
        for op in &mut self.pending {
            op.reset_asked(true);
        }
        self.delete_dead_containers(now);
        self.after_step();
    }

    fn after_step(&mut self) {
        if self.stopped {
            return;
        }
        self.try_pending_ops();
        self.report_free_space();
    }

    fn check_subnet(&self, subnet: Cidr) -> Result<(), AllocError> {
        subnet
            .validate_subnet()
            .map_err(|e| AllocError::InvalidSubnet(subnet, e))?;
        if !subnet.range().overlaps(&self.ring.universe()) {
            return Err(AllocError::SubnetOutsideUniverse {
                subnet,
                universe: self.config.universe,
            });
        }
        Ok(())
    }

    // Requests waiting for space

    fn enqueue(&mut self, op: Operation) {
        let mut demand = self.demand();
        if let Operation::Allocate(a) = &op {
            *demand.entry(a.subnet).or_default() += 1;
        }
        if let Some(op) = self.try_op(op, &demand) {
            log_as!(debug, self, "parked request for {}", op.identity());
            self.pending.push_back(op);
        }
    }

    /// Parked allocations per subnet, sent to donors as a size hint.
    fn demand(&self) -> BTreeMap<Cidr, Count> {
        let mut demand = BTreeMap::new();
        for op in &self.pending {
            if let Operation::Allocate(a) = op {
                *demand.entry(a.subnet).or_default() += 1;
            }
        }
        demand
    }

    fn try_pending_ops(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let ring_changed = std::mem::take(&mut self.ring_changed);
        let demand = self.demand();

        for mut op in std::mem::take(&mut self.pending) {
            if op.is_cancelled() {
                log_as!(debug, self, "request for {} cancelled", op.identity());
                op.fail(AllocError::Cancelled);
                continue;
            }
            if ring_changed {
                op.reset_asked(false);
            }
            if let Some(op) = self.try_op(op, &demand) {
                self.pending.push_back(op);
            }
        }
    }

    /// Answers `op` if possible, otherwise hands it back.
    fn try_op(&mut self, op: Operation, demand: &BTreeMap<Cidr, Count>) -> Option<Operation> {
        match op {
            Operation::Allocate(mut a) => {
                let wanted = demand.get(&a.subnet).copied().unwrap_or(1);
                match self.try_allocate(&mut a, wanted) {
                    Some(result) => {
                        let _ = a.responder.send(result);
                        None
                    }
                    None => Some(Operation::Allocate(a)),
                }
            }
            Operation::Claim(mut c) => match self.try_claim(&mut c) {
                Some(result) => {
                    if c.preclaim {
                        if let Err(e) = &result {
                            log_as!(warn, self, "dropping address {} of {}: {e}", c.cidr, c.identity);
                        }
                    }
                    if let Some(responder) = c.responder {
                        let _ = responder.send(result);
                    }
                    None
                }
                None => Some(Operation::Claim(c)),
            },
        }
    }

    fn try_allocate(&mut self, op: &mut AllocateOp, demand: Count) -> Option<Result<Address, AllocError>> {
        if let Some(&addr) = self.addresses_of(&op.identity, op.subnet).first() {
            return Some(Ok(addr));
        }
        if self.ring.is_empty() {
            self.establish_ring();
            return None;
        }

        let cursor = self.space.cursor();
        if let Some(addr) = self.space.allocate(op.subnet.host_range()) {
            self.add_owned(&op.identity, op.subnet.with_addr(addr), op.is_container);
            if let Err(e) = self.persist() {
                self.remove_owned(&op.identity, addr);
                let _ = self.space.free(addr);
                self.space.set_cursor(cursor);
                return Some(Err(e));
            }
            log_as!(debug, self, "allocated {addr} for {} in {}", op.identity, op.subnet);
            return Some(Ok(addr));
        }

        if op.awaiting.is_some() {
            return None;
        }
        let range = op.subnet.range();
        for donor in self.ring.choose_peers_to_ask_for_space(range) {
            if !op.asked.insert(donor.clone()) {
                continue;
            }
            let request = GossipMessage::SpaceRequest {
                range,
                amount_hint: demand,
            };
            match self.unicast(&donor, &request) {
                Ok(()) => {
                    log_as!(debug, self, "asking {donor} for space in {range}");
                    op.awaiting = Some(donor);
                    return None;
                }
                Err(e) => log_as!(debug, self, "cannot ask {donor} for space: {e}"),
            }
        }
        None
    }

    fn try_claim(&mut self, op: &mut ClaimOp) -> Option<Result<(), AllocError>> {
        let addr = op.cidr.addr;
        if let Some(owner) = op.denied_by.take() {
            return Some(Err(AllocError::AddressOwnedElsewhere { addr, owner }));
        }
        if !self.ring.contains(addr) {
            if op.no_error_on_unknown {
                log_as!(info, self, "ignoring claim of {addr} outside the universe");
                return Some(Ok(()));
            }
            return Some(Err(AllocError::NotInUniverse {
                addr,
                universe: self.config.universe,
            }));
        }
        if self.ring.is_empty() {
            self.establish_ring();
            return None;
        }

        let owner = self.ring.owner(addr)?.clone();
        if owner == self.our_name {
            return Some(self.claim_local(op));
        }
        if op.preclaim {
            log_as!(warn, self, "dropping address {addr} of {}: owned by {owner}", op.identity);
            return Some(Ok(()));
        }
        if op.requested_from.is_some() {
            return None;
        }

        let request = GossipMessage::SpaceRequest {
            range: Range::with_size(addr, 1),
            amount_hint: 1,
        };
        match self.unicast(&owner, &request) {
            Ok(()) => {
                log_as!(debug, self, "asking {owner} for {addr}");
                op.requested_from = Some(owner);
                None
            }
            Err(e) if op.no_error_on_unknown => {
                log_as!(info, self, "cannot ask {owner} for {addr} ({e}), will retry");
                None
            }
            Err(_) => Some(Err(AllocError::OwnerUnreachable { addr, owner })),
        }
    }

    fn claim_local(&mut self, op: &ClaimOp) -> Result<(), AllocError> {
        let addr = op.cidr.addr;
        match self.space.claim(addr) {
            Ok(()) => {
                self.add_owned(&op.identity, op.cidr, op.is_container);
                if let Err(e) = self.persist() {
                    self.remove_owned(&op.identity, addr);
                    let _ = self.space.free(addr);
                    return Err(e);
                }
                log_as!(debug, self, "claimed {} for {}", op.cidr, op.identity);
                Ok(())
            }
            Err(SpaceError::Taken(_)) => match self.holder_of(addr) {
                Some(holder) if holder == op.identity => Ok(()),
                Some(holder) => Err(AllocError::AddressInUse { addr, holder }),
                None => Err(SpaceError::Taken(addr).into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    fn expire_ops(&mut self, now: Instant) {
        let (expired, waiting): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|op| op.is_expired(now));
        self.pending = waiting;

        for op in expired {
            log_as!(info, self, "request for {} timed out", op.identity());
            let error = match &op {
                Operation::Allocate(a) => AllocError::NoFreeSpace(a.subnet),
                Operation::Claim(c) => AllocError::Timeout(c.cidr.addr),
            };
            op.fail(error);
        }
    }

    fn cancel_ops_for(&mut self, identity: &str) {
        let (cancelled, kept): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|op| op.identity() == identity);
        self.pending = kept;
        for op in cancelled {
            op.fail(AllocError::Cancelled);
        }
    }

    // Allocations

    fn addresses_of(&self, identity: &str, subnet: Cidr) -> Vec<Address> {
        let range = subnet.range();
        self.owned
            .get(identity)
            .map(|o| {
                o.cidrs
                    .iter()
                    .map(|c| c.addr)
                    .filter(|a| range.contains(*a))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn holder_of(&self, addr: Address) -> Option<String> {
        self.owned
            .iter()
            .find(|(_, o)| o.cidrs.iter().any(|c| c.addr == addr))
            .map(|(identity, _)| identity.clone())
    }

    fn add_owned(&mut self, identity: &str, cidr: Cidr, is_container: bool) {
        self.owned
            .entry(identity.to_string())
            .or_insert_with(|| Owned {
                is_container,
                cidrs: Vec::new(),
            })
            .cidrs
            .push(cidr);
    }

    fn remove_owned(&mut self, identity: &str, addr: Address) -> Option<Cidr> {
        let owned = self.owned.get_mut(identity)?;
        let i = owned.cidrs.iter().position(|c| c.addr == addr)?;
        let cidr = owned.cidrs.remove(i);
        if owned.cidrs.is_empty() {
            self.owned.remove(identity);
        }
        Some(cidr)
    }

    /// Drops persisted allocations that fall outside the ranges we own.
    fn restore_allocations(&mut self) {
        let mut lost = Vec::new();
        for (identity, owned) in &self.owned {
            for cidr in &owned.cidrs {
                if let Err(e) = self.space.claim(cidr.addr) {
                    log_as!(warn, self, "forgetting {cidr} of {identity}: {e}");
                    lost.push((identity.clone(), cidr.addr));
                }
            }
        }
        for (identity, addr) in lost {
            self.remove_owned(&identity, addr);
        }
    }

    fn reconcile(&mut self, preclaims: Vec<PreClaim>) {
        for PreClaim { identity, cidr } in preclaims {
            match self.holder_of(cidr.addr) {
                Some(holder) if holder == identity => {}
                Some(holder) => {
                    log_as!(info, self, "{} was recorded for {holder}, now used by {identity}", cidr.addr);
                    self.remove_owned(&holder, cidr.addr);
                    self.add_owned(&identity, cidr, true);
                }
                None => self.enqueue(Operation::Claim(ClaimOp {
                    identity,
                    cidr,
                    is_container: true,
                    no_error_on_unknown: true,
                    preclaim: true,
                    deadline: None,
                    cancel: None,
                    responder: None,
                    requested_from: None,
                    denied_by: None,
                })),
            }
        }
    }

    fn free(&mut self, identity: &str, addr: Address) -> Result<(), AllocError> {
        let is_container = self.owned.get(identity).is_some_and(|o| o.is_container);
        let Some(cidr) = self.remove_owned(identity, addr) else {
            return Err(AllocError::NotFound {
                identity: identity.to_string(),
                addr,
            });
        };
        if let Err(e) = self.space.free(addr) {
            log_as!(warn, self, "freeing {addr} of {identity}: {e}");
        }
        if let Err(e) = self.persist() {
            self.add_owned(identity, cidr, is_container);
            let _ = self.space.claim(addr);
            return Err(e);
        }
        log_as!(debug, self, "freed {addr} of {identity}");
        Ok(())
    }

    fn delete(&mut self, identity: &str) -> Result<usize, AllocError> {
        self.cancel_ops_for(identity);
        let Some(owned) = self.owned.remove(identity) else {
            return Ok(0);
        };
        for cidr in &owned.cidrs {
            if let Err(e) = self.space.free(cidr.addr) {
                log_as!(warn, self, "freeing {cidr} of {identity}: {e}");
            }
        }
        if let Err(e) = self.persist() {
            for cidr in &owned.cidrs {
                let _ = self.space.claim(cidr.addr);
            }
            self.owned.insert(identity.to_string(), owned);
            return Err(e);
        }
        self.dead.remove(identity);
        log_as!(debug, self, "deleted {} addresses of {identity}", owned.cidrs.len());
        Ok(owned.cidrs.len())
    }

    fn container_died(&mut self, identity: &str, now: Instant) {
        self.cancel_ops_for(identity);
        if self.owned.get(identity).is_some_and(|o| o.is_container) {
            log_as!(debug, self, "container {identity} died");
            self.dead.insert(identity.to_string(), now);
        }
    }

    fn delete_dead_containers(&mut self, now: Instant) {
        let grace = self.config.container_died_grace;
        let expired: Vec<String> = self
            .dead
            .iter()
            .filter(|(_, died)| now.saturating_duration_since(**died) >= grace)
            .map(|(identity, _)| identity.clone())
            .collect();

        for identity in expired {
            match self.delete(&identity) {
                Ok(n) => log_as!(info, self, "freed {n} addresses of dead container {identity}"),
                Err(e) => log_as!(warn, self, "could not free addresses of {identity}: {e}"),
            }
        }
    }

    fn prune_owned(&mut self, live: &BTreeSet<String>) -> Result<usize, AllocError> {
        let gone: Vec<String> = self
            .owned
            .iter()
            .filter(|(identity, o)| o.is_container && !live.contains(*identity))
            .map(|(identity, _)| identity.clone())
            .collect();

        let mut freed = 0;
        for identity in gone {
            freed += self.delete(&identity)?;
        }
        if freed > 0 {
            log_as!(info, self, "pruned {freed} addresses of containers that are gone");
        }
        Ok(freed)
    }

    // Ring changes

    /// Makes `candidate` our ring: tells the tracker, persists, then swaps
    /// it in. Nothing changes if either of the first two fails.
    fn commit_ring(&mut self, candidate: Ring) -> Result<(), AllocError> {
        let before = self.ring.owned_ranges();
        let after = candidate.owned_ranges();
        let changes = tracker::transitions(&before, &after);

        if let Some(hook) = self.tracker.as_deref_mut() {
            if let Err(e) = tracker::apply(hook, &changes) {
                log_as!(error, self, "range tracker failed: {e:#}");
                return Err(AllocError::Tracker(format!("{e:#}")));
            }
        }

        let state = PersistedState::capture(&self.our_name, &candidate, &self.owned, &self.nicknames);
        if let Err(e) = self.save(&state) {
            if let Some(hook) = self.tracker.as_deref_mut() {
                tracker::revert(hook, &changes);
            }
            return Err(e);
        }

        let was_empty = self.ring.is_empty();
        self.ring = candidate;
        self.space.update_ranges(&after);
        if was_empty && !self.ring.is_empty() {
            self.paxos = None;
            log_as!(info, self, "ring established, we own {} addresses", self.space.num_free() + self.space.num_allocated());
        }
        Ok(())
    }

    fn create_ring(&mut self, peers: &[PeerName]) -> Result<(), AllocError> {
        let mut candidate = self.ring.clone();
        candidate.claim_for_peers(peers);
        self.commit_ring(candidate)?;
        self.ring_changed = true;
        log_as!(info, self, "created the initial ring for {}", peers.iter().join(", "));
        self.broadcast_ring();
        Ok(())
    }

    /// Starts whatever gets us a ring, once per request burst.
    fn establish_ring(&mut self) {
        if matches!(self.config.mode, Mode::Consensus(_)) {
            let Some(node) = self.paxos.as_mut() else {
                return;
            };
            if node.is_proposing() || node.consensus().is_some() {
                return;
            }
            let out = node.propose();
            log_as!(info, self, "starting election of the initial ring");
            self.send_paxos(out);
            self.check_consensus();
        } else if matches!(self.config.mode, Mode::Observer | Mode::Unset) && !self.ring_requested {
            self.ring_requested = true;
            self.broadcast(&GossipMessage::RingRequest);
        }
    }

    fn retry_election(&mut self) {
        if let Mode::Seed(seeds) = self.config.mode.clone() {
            if let Err(e) = self.create_ring(&seeds) {
                log_as!(error, self, "failed to create the initial ring: {e}");
            }
            return;
        }

        self.check_consensus();
        if !self.ring.is_empty() {
            return;
        }
        if let Some(node) = self.paxos.as_mut().filter(|n| n.is_proposing()) {
            let out = node.propose();
            self.send_paxos(out);
            self.check_consensus();
        }
    }

    fn check_consensus(&mut self) {
        if !self.ring.is_empty() {
            return;
        }
        let Some(peers) = self
            .paxos
            .as_ref()
            .and_then(Node::consensus)
            .map(<[PeerName]>::to_vec)
        else {
            return;
        };
        log_as!(info, self, "consensus reached on {}", peers.iter().join(", "));
        if let Err(e) = self.create_ring(&peers) {
            log_as!(error, self, "failed to create the initial ring: {e}");
        }
    }

    fn report_free_space(&mut self) {
        if self.ring.is_empty() {
            return;
        }
        let free: BTreeMap<Address, Count> = self
            .ring
            .owned_entries()
            .into_iter()
            .map(|(token, ranges)| {
                let free = ranges.iter().map(|r| self.space.num_free_in_range(*r)).sum();
                (token, free)
            })
            .collect();
        if free.is_empty() {
            return;
        }

        let mut candidate = self.ring.clone();
        if candidate.report_free(&free) {
            if let Err(e) = self.commit_ring(candidate) {
                log_as!(warn, self, "could not record free space: {e}");
            }
        }
    }

    fn admin_rm_peer(&mut self, name: &str) -> Result<Count, AllocError> {
        let peer = self.resolve_peer(name)?;
        if peer == self.our_name {
            return Err(AllocError::RemoveSelf);
        }

        let mut candidate = self.ring.clone();
        let taken = candidate.transfer(&peer, &self.our_name);
        if taken.is_empty() {
            log_as!(info, self, "{peer} owns nothing, nothing to take over");
            self.nicknames.remove(&peer);
            return Ok(0);
        }

        let before = self.space.num_free();
        self.commit_ring(candidate)?;
        self.ring_changed = true;
        self.nicknames.remove(&peer);
        self.broadcast_ring();

        let gained = self.space.num_free().saturating_sub(before);
        log_as!(
            info,
            self,
            "took over {} from {peer}, {gained} more free addresses",
            taken.iter().join(", ")
        );
        Ok(gained)
    }

    /// Accepts a peer name or a nickname.
    fn resolve_peer(&self, name: &str) -> Result<PeerName, AllocError> {
        let parsed = name.parse::<PeerName>();
        if let Ok(peer) = &parsed {
            if self.ring.peer_names().contains(peer) {
                return Ok(peer.clone());
            }
        }
        if let Some((peer, _)) = self.nicknames.iter().find(|(_, nick)| nick.as_str() == name) {
            return Ok(peer.clone());
        }
        parsed.map_err(|_| AllocError::InvalidPeer(name.to_string()))
    }

    fn peer_gone(&mut self, peer: &PeerName) {
        log_as!(debug, self, "peer {peer} is gone");
        for op in &mut self.pending {
            match op {
                Operation::Allocate(a) if a.awaiting.as_ref() == Some(peer) => a.awaiting = None,
                Operation::Claim(c) if c.requested_from.as_ref() == Some(peer) => {
                    c.requested_from = None
                }
                _ => {}
            }
        }
        let ring_peers = self.ring.peer_names();
        let nicknames = std::mem::take(&mut self.nicknames);
        self.nicknames = nicknames
            .into_iter()
            .filter(|(name, _)| self.keeps_nickname(name, &ring_peers, Some(peer)))
            .collect();
    }

    /// Nicknames are kept for ourselves, peers on the ring and peers the
    /// transport still knows about.
    fn keeps_nickname(&self, name: &PeerName, ring_peers: &BTreeSet<PeerName>, gone: Option<&PeerName>) -> bool {
        *name == self.our_name
            || ring_peers.contains(name)
            || (gone != Some(name) && self.gossip.is_known_peer(name))
    }

    /// Heir for our ranges: live peers on the ring, then live peers we only
    /// know by nickname, then anybody.
    fn pick_peer_for_transfer(&self) -> Option<PeerName> {
        let live = |p: &PeerName| self.gossip.is_known_peer(p);
        let anyone = |_: &PeerName| true;
        self.ring
            .pick_peer_for_transfer(live)
            .or_else(|| self.pick_peer_from_nicknames(live))
            .or_else(|| self.ring.pick_peer_for_transfer(anyone))
            .or_else(|| self.pick_peer_from_nicknames(anyone))
    }

    fn pick_peer_from_nicknames(&self, is_valid: impl Fn(&PeerName) -> bool) -> Option<PeerName> {
        self.nicknames
            .keys()
            .find(|name| **name != self.our_name && is_valid(name))
            .cloned()
    }

    // Gossip

    fn on_gossip(&mut self, sender: &PeerName, bytes: &[u8]) -> Result<(), AllocError> {
        let msg = gossip::decode(bytes).map_err(|e| AllocError::Gossip(e.to_string()))?;
        log_as!(trace, self, "{} from {sender}", msg.kind());

        match msg {
            GossipMessage::RingUpdate { ring, nicknames } => {
                self.on_ring_update(sender, &ring, nicknames)?
            }
            GossipMessage::SpaceRequest { range, amount_hint } => {
                self.donate_space(sender, range, amount_hint)
            }
            GossipMessage::SpaceResponse { requested, granted } => {
                self.on_space_response(sender, requested, granted)
            }
            GossipMessage::RingRequest => {
                if !self.ring.is_empty() {
                    self.send_ring_to(sender);
                }
            }
            GossipMessage::Paxos(msg) => self.on_paxos(sender, msg),
        }
        Ok(())
    }

    fn on_ring_update(
        &mut self,
        sender: &PeerName,
        ring: &RingState,
        nicknames: BTreeMap<PeerName, String>,
    ) -> Result<(), AllocError> {
        let mut candidate = self.ring.clone();
        let updated = candidate
            .merge(ring)
            .map_err(|e| AllocError::Gossip(format!("ring from {sender}: {e}")))?;

        let mut merged = self.nicknames.clone();
        for (peer, nickname) in nicknames {
            if peer != self.our_name {
                merged.insert(peer, nickname);
            }
        }
        if !updated {
            self.nicknames = merged;
            return Ok(());
        }

        let ring_peers = candidate.peer_names();
        merged.retain(|name, _| self.keeps_nickname(name, &ring_peers, None));
        let previous = std::mem::replace(&mut self.nicknames, merged);
        let was_empty = self.ring.is_empty();
        if let Err(e) = self.commit_ring(candidate) {
            self.nicknames = previous;
            return Err(e);
        }
        self.ring_changed = true;
        if was_empty {
            log_as!(info, self, "received the ring from {sender}");
        }
        Ok(())
    }

    /// Gives part of our free space inside `range` to `requester`. The ring
    /// is persisted before anybody hears about the grant.
    fn donate_space(&mut self, requester: &PeerName, range: Range, amount_hint: Count) {
        if self.ring.is_empty() || *requester == self.our_name {
            return;
        }

        let granted = match self.space.donate(range, amount_hint) {
            None => {
                log_as!(debug, self, "no free space in {range} for {requester}");
                None
            }
            Some(chunk) => {
                let mut candidate = self.ring.clone();
                candidate.grant_range(chunk.start, chunk.end, requester);
                match self.commit_ring(candidate) {
                    Ok(()) => {
                        log_as!(info, self, "gave {chunk} to {requester}");
                        Some(chunk)
                    }
                    Err(e) => {
                        log_as!(warn, self, "could not give {chunk} to {requester}: {e}");
                        // put the chunk back into our free space
                        self.space.update_ranges(&self.ring.owned_ranges());
                        None
                    }
                }
            }
        };

        // The ring goes first so the requester can use the space right away
        self.send_ring_to(requester);
        if granted.is_some() {
            self.broadcast_ring();
        }
        let response = GossipMessage::SpaceResponse {
            requested: range,
            granted,
        };
        if let Err(e) = self.unicast(requester, &response) {
            log_as!(debug, self, "cannot answer {requester}: {e}");
        }
    }

    fn on_space_response(&mut self, donor: &PeerName, requested: Range, granted: Option<Range>) {
        match granted {
            Some(chunk) => log_as!(debug, self, "{donor} gave us {chunk}"),
            None => log_as!(debug, self, "{donor} has no space in {requested}"),
        }
        for op in &mut self.pending {
            match op {
                Operation::Allocate(a) if a.awaiting.as_ref() == Some(donor) => a.awaiting = None,
                Operation::Claim(c)
                    if c.requested_from.as_ref() == Some(donor)
                        && requested.contains(c.cidr.addr) =>
                {
                    c.requested_from = None;
                    if granted.is_none() {
                        c.denied_by = Some(donor.clone());
                    }
                }
                _ => {}
            }
        }
    }

    fn on_paxos(&mut self, sender: &PeerName, msg: PaxosMessage) {
        if !self.ring.is_empty() {
            // a late joiner: the election is long over
            self.send_ring_to(sender);
            return;
        }
        let Some(node) = self.paxos.as_mut() else {
            log_as!(debug, self, "ignoring election message from {sender}");
            return;
        };
        let out = node.handle(sender, msg);
        self.send_paxos(out);
        self.check_consensus();
    }

    fn send_paxos(&self, out: Vec<Outbound>) {
        for out in out {
            match out {
                Outbound::Broadcast(msg) => self.broadcast(&GossipMessage::Paxos(msg)),
                Outbound::Unicast(to, msg) => {
                    if let Err(e) = self.unicast(&to, &GossipMessage::Paxos(msg)) {
                        log_as!(debug, self, "cannot reach {to}: {e}");
                    }
                }
            }
        }
    }

    fn unicast(&self, to: &PeerName, msg: &GossipMessage) -> anyhow::Result<()> {
        let bytes = gossip::encode(msg)?;
        self.gossip.gossip_unicast(to, bytes)
    }

    fn broadcast(&self, msg: &GossipMessage) {
        let result = gossip::encode(msg)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| self.gossip.gossip_broadcast(bytes));
        if let Err(e) = result {
            log_as!(warn, self, "failed to broadcast {}: {e}", msg.kind());
        }
    }

    fn ring_update(&self) -> GossipMessage {
        GossipMessage::RingUpdate {
            ring: self.ring.state(),
            nicknames: self.nicknames.clone(),
        }
    }

    fn broadcast_ring(&self) {
        if !self.ring.is_empty() {
            self.broadcast(&self.ring_update());
        }
    }

    fn send_ring_to(&self, to: &PeerName) {
        if let Err(e) = self.unicast(to, &self.ring_update()) {
            log_as!(debug, self, "cannot send the ring to {to}: {e}");
        }
    }

    // Persistence and status

    fn persist(&mut self) -> Result<(), AllocError> {
        let state = PersistedState::capture(&self.our_name, &self.ring, &self.owned, &self.nicknames);
        self.save(&state)
    }

    fn save(&mut self, state: &PersistedState) -> Result<(), AllocError> {
        persistence::save(&mut *self.store, state).map_err(|e| {
            log_as!(error, self, "failed to persist state: {e:#}");
            AllocError::Store(format!("{e:#}"))
        })
    }

    fn status(&self) -> Status {
        Status {
            name: self.our_name.clone(),
            nickname: self.config.our_nickname.clone(),
            state: self.state(),
            universe: self.config.universe,
            default_subnet: self.config.default_subnet,
            entries: self.ring.all_range_info(),
            owned_ranges: self.ring.owned_ranges(),
            free: self.space.num_free(),
            allocated: self.space.num_allocated(),
            pending_ops: self.pending.len(),
            election: self
                .paxos
                .as_ref()
                .filter(|n| n.is_proposing())
                .map(|n| ElectionStatus {
                    quorum: n.quorum(),
                    known_peers: n.known_peers().iter().cloned().collect(),
                }),
        }
    }

    fn shutdown(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        log_as!(info, self, "shutting down, cancelling {} requests", pending.len());
        for op in pending {
            op.fail(AllocError::ShuttingDown);
        }
        self.hand_over_ranges();
        self.stopped = true;
    }

    /// Gives everything we own to another peer before we go.
    fn hand_over_ranges(&mut self) {
        if self.ring.owned_ranges().is_empty() {
            return;
        }
        let Some(heir) = self.pick_peer_for_transfer() else {
            log_as!(info, self, "nobody to hand our ranges to");
            return;
        };

        let mut candidate = self.ring.clone();
        let given = candidate.transfer(&self.our_name, &heir);
        match self.commit_ring(candidate) {
            Ok(()) => {
                log_as!(info, self, "handed {} to {heir}", given.iter().join(", "));
                self.broadcast_ring();
            }
            Err(e) => log_as!(warn, self, "could not hand our ranges to {heir}: {e}"),
        }
    }

    #[cfg(test)]
    pub fn nicknames(&self) -> &BTreeMap<PeerName, String> {
        &self.nicknames
    }
}
