//! Ring CRDT mapping address tokens to owning peers.
//!
//! Each entry owns the addresses from its token up to the next token,
//! wrapping at the end of the universe back to the first token. Only the
//! owner of an entry may bump its version, except when a range is granted
//! to another peer or taken over by `transfer`.

mod entries;

pub use entries::Entry;

use crate::address::{Address, Count, Range};
use crate::peer::PeerName;
use entries::Entries;
use itertools::Itertools;
use rand::rng;
use rand_distr::{Distribution, weighted::WeightedIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RingError {
    #[error("entry at {token} owned by {owner} is inside a range owned by us")]
    EntryInMyRange { token: Address, owner: PeerName },
    #[error("received newer version {theirs} of our own entry at {token} (ours is {ours})")]
    NewerVersion {
        token: Address,
        ours: u32,
        theirs: u32,
    },
    #[error("inconsistent entries at {0}: same version, different content")]
    Inconsistent(Address),
    #[error("different seeds: ours {ours:?}, theirs {theirs:?}")]
    DifferentSeeds {
        ours: Vec<PeerName>,
        theirs: Vec<PeerName>,
    },
    #[error("different universe: ours {ours}, theirs {theirs}")]
    DifferentRange { ours: Range, theirs: Range },
    #[error("entries are not sorted at {0}")]
    NotSorted(Address),
    #[error("token {0} is repeated")]
    TokenRepeated(Address),
    #[error("token {token} is outside of {universe}")]
    TokenOutOfRange { token: Address, universe: Range },
    #[error("entry at {token} reports {free} free but only spans {size}")]
    TooMuchFree {
        token: Address,
        free: Count,
        size: Count,
    },
}

/// The part of a ring that is gossiped and persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RingState {
    pub universe: Range,
    pub entries: Vec<Entry>,
    pub seeds: Vec<PeerName>,
}

/// Range owned by a peer, for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RangeInfo {
    pub owner: PeerName,
    pub range: Range,
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ring {
    universe: Range,
    peer: PeerName,
    entries: Entries,
    seeds: Vec<PeerName>,
}

impl Ring {
    pub fn new(universe: Range, peer: PeerName) -> Self {
        Self {
            universe,
            peer,
            entries: Entries::default(),
            seeds: Vec::new(),
        }
    }

    /// Rebuilds a ring from persisted state, validating it like gossip.
    pub fn restore(peer: PeerName, state: RingState) -> Result<Self, RingError> {
        check_entries(&state.universe, &state.entries)?;
        Ok(Self {
            universe: state.universe,
            peer,
            entries: Entries(state.entries),
            seeds: state.seeds,
        })
    }

    pub fn state(&self) -> RingState {
        RingState {
            universe: self.universe,
            entries: self.entries.0.clone(),
            seeds: self.seeds.clone(),
        }
    }

    pub fn universe(&self) -> Range {
        self.universe
    }

    #[cfg(test)]
    pub fn seeds(&self) -> &[PeerName] {
        &self.seeds
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries.0
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Panics when a local mutation left the ring inconsistent. Gossiping
    /// such a ring would corrupt every other replica.
    fn assert_invariants(&self) {
        if let Err(e) = check_entries(&self.universe, &self.entries.0) {
            panic!("ring invariant violated on {}: {e}", self.peer);
        }
    }

    /// Size of the range owned by entry `i`.
    fn span(&self, i: usize) -> Count {
        span(&self.universe, &self.entries.0, i)
    }

    /// Splits the universe between `peers`, which must be non-empty. Only
    /// allowed on an empty ring.
    pub fn claim_for_peers(&mut self, peers: &[PeerName]) {
        assert!(self.is_empty(), "claiming for peers on a non-empty ring");
        let peers: Vec<PeerName> = peers.iter().cloned().sorted().dedup().collect();
        assert!(!peers.is_empty(), "claiming for an empty list of peers");

        self.subdivide(self.universe.start, self.universe.end, &peers);
        self.seeds = peers;
        self.assert_invariants();
    }

    fn subdivide(&mut self, from: Address, to: Address, peers: &[PeerName]) {
        let share = from.distance_to(to);
        if share == 0 || peers.is_empty() {
            return;
        }
        if share == 1 || peers.len() == 1 {
            self.entries.insert(Entry::new(from, peers[0].clone(), share));
            return;
        }

        let mid = from.add(share / 2);
        let half = peers.len() / 2;
        self.subdivide(from, mid, &peers[..half]);
        self.subdivide(mid, to, &peers[half..]);
    }

    /// Hands `[start, end)` over to `to`. Every address in the range must
    /// currently be owned by us.
    pub fn grant_range(&mut self, start: Address, end: Address, to: &PeerName) {
        assert!(start < end, "granting an empty range {start}-{end}");
        assert!(
            self.universe.start <= start && end <= self.universe.end,
            "granting {start}-{end} outside of {}",
            self.universe
        );
        assert!(*to != self.peer, "granting a range to ourselves");
        assert!(!self.is_empty(), "granting from an empty ring");

        let first = self.entries.covering(start);
        assert!(
            self.entries.entry(first).owner == self.peer,
            "granting {start}-{end} which starts in a range we don't own"
        );
        for entry in self.entries.iter() {
            if entry.token > start && entry.token < end {
                assert!(
                    entry.owner == self.peer,
                    "granting {start}-{end} which spans {} owned by {}",
                    entry.token,
                    entry.owner
                );
            }
        }

        // Remainder after the range stays ours
        let end_token = if end == self.universe.end {
            self.universe.start
        } else {
            end
        };
        if self.entries.find(end_token).is_err() {
            self.entries.insert(Entry::new(end_token, self.peer.clone(), 0));
            let i = self.entries.covering(end_token);
            self.entries.0[i].free = self.span(i);
        }

        match self.entries.find(start) {
            Ok(i) => {
                let free = self.span(i);
                self.entries.0[i].update(to.clone(), free);
            }
            Err(_) => {
                let i = self.entries.insert(Entry::new(start, to.clone(), 0));
                self.entries.0[i].free = self.span(i);
                // Our entry before the new token shrank
                let prev = (i + self.entries.len() - 1) % self.entries.len();
                let free = self.entries.0[prev].free.min(self.span(prev));
                self.entries.0[prev].update(self.peer.clone(), free);
            }
        }

        for i in 0..self.entries.len() {
            let token = self.entries.0[i].token;
            if token > start && token < end {
                let free = self.span(i);
                self.entries.0[i].update(to.clone(), free);
            }
        }

        self.assert_invariants();
    }

    /// Merges a gossiped ring into ours. Returns whether anything changed.
    /// On error our state is left untouched.
    pub fn merge(&mut self, incoming: &RingState) -> Result<bool, RingError> {
        if incoming.universe != self.universe {
            return Err(RingError::DifferentRange {
                ours: self.universe,
                theirs: incoming.universe,
            });
        }
        check_entries(&incoming.universe, &incoming.entries)?;

        let seeds = match (self.seeds.is_empty(), incoming.seeds.is_empty()) {
            (_, true) => self.seeds.clone(),
            (true, false) => incoming.seeds.clone(),
            (false, false) if self.seeds == incoming.seeds => self.seeds.clone(),
            (false, false) => {
                return Err(RingError::DifferentSeeds {
                    ours: self.seeds.clone(),
                    theirs: incoming.seeds.clone(),
                });
            }
        };

        let (result, mut updated) = self.entries.merge(&incoming.entries, &self.peer)?;
        check_entries(&self.universe, &result)?;

        updated |= seeds != self.seeds;
        self.entries = Entries(result);
        self.seeds = seeds;
        Ok(updated)
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.universe.contains(addr)
    }

    /// Owner of the range containing `addr`, none on an empty ring.
    pub fn owner(&self, addr: Address) -> Option<&PeerName> {
        if self.is_empty() || !self.contains(addr) {
            return None;
        }
        Some(&self.entries.entry(self.entries.covering(addr)).owner)
    }

    /// Range covered by entry `i`, split in two if it wraps past the end of
    /// the universe.
    fn entry_ranges(&self, i: usize) -> Vec<Range> {
        let token = self.entries.entry(i).token;
        let next = self.entries.entry(i + 1).token;
        if next > token {
            vec![Range::new(token, next)]
        } else {
            // wraps, or a single entry owning everything
            [
                Range::new(token, self.universe.end),
                Range::new(self.universe.start, next),
            ]
            .into_iter()
            .filter(|r| r.start < r.end)
            .collect()
        }
    }

    /// Ranges owned by us, sorted and coalesced.
    pub fn owned_ranges(&self) -> Vec<Range> {
        self.owned_ranges_of(&self.peer)
    }

    pub fn owned_ranges_of(&self, peer: &PeerName) -> Vec<Range> {
        let pieces = (0..self.entries.len())
            .filter(|&i| self.entries.0[i].owner == *peer)
            .flat_map(|i| self.entry_ranges(i))
            .sorted();
        coalesce(pieces)
    }

    /// Tokens we own, with the ranges each one covers.
    pub fn owned_entries(&self) -> Vec<(Address, Vec<Range>)> {
        (0..self.entries.len())
            .filter(|&i| self.entries.0[i].owner == self.peer)
            .map(|i| (self.entries.0[i].token, self.entry_ranges(i)))
            .collect()
    }

    pub fn all_range_info(&self) -> Vec<RangeInfo> {
        (0..self.entries.len())
            .flat_map(|i| {
                let entry = &self.entries.0[i];
                self.entry_ranges(i).into_iter().map(|range| RangeInfo {
                    owner: entry.owner.clone(),
                    range,
                    version: entry.version,
                })
            })
            .sorted_by_key(|info| info.range)
            .collect()
    }

    /// Peers advertising free space overlapping `range`, in weighted random
    /// order: more free space means a better chance of coming first.
    pub fn choose_peers_to_ask_for_space(&self, range: Range) -> Vec<PeerName> {
        let mut space_per_peer: BTreeMap<&PeerName, Count> = BTreeMap::new();

        for i in 0..self.entries.len() {
            let entry = &self.entries.0[i];
            if entry.free == 0 || entry.owner == self.peer {
                continue;
            }
            if self.entry_ranges(i).iter().any(|r| r.overlaps(&range)) {
                *space_per_peer.entry(&entry.owner).or_default() += entry.free;
            }
        }

        let (mut peers, mut weights): (Vec<_>, Vec<_>) = space_per_peer
            .into_iter()
            .map(|(peer, free)| (peer.clone(), free as f64))
            .unzip();

        let mut rng = rng();
        let mut result = Vec::with_capacity(peers.len());
        while !peers.is_empty() {
            // weights are all positive, so this only fails on an empty list
            let Ok(dist) = WeightedIndex::new(&weights) else {
                break;
            };
            let chosen = dist.sample(&mut rng);
            weights.swap_remove(chosen);
            result.push(peers.swap_remove(chosen));
        }
        result
    }

    /// Reassigns everything owned by `from` to `to`. Returns the ranges that
    /// changed hands.
    pub fn transfer(&mut self, from: &PeerName, to: &PeerName) -> Vec<Range> {
        let mut pieces = Vec::new();
        for i in 0..self.entries.len() {
            if self.entries.0[i].owner == *from {
                pieces.extend(self.entry_ranges(i));
                let free = self.entries.0[i].free;
                self.entries.0[i].update(to.clone(), free);
            }
        }
        self.assert_invariants();
        coalesce(pieces.into_iter().sorted())
    }

    /// Updates the free hints of our own entries, keyed by token. Returns
    /// whether any entry changed.
    pub fn report_free(&mut self, free_per_token: &BTreeMap<Address, Count>) -> bool {
        let mut updated = false;
        for (&token, &free) in free_per_token {
            let Ok(i) = self.entries.find(token) else {
                panic!("reporting free space for unknown token {token}");
            };
            let entry = &self.entries.0[i];
            assert!(
                entry.owner == self.peer,
                "reporting free space for {token} owned by {}",
                entry.owner
            );
            if entry.free == free {
                continue;
            }
            let owner = entry.owner.clone();
            self.entries.0[i].update(owner, free);
            updated = true;
        }
        self.assert_invariants();
        updated
    }

    /// First peer on the ring, other than us, that `is_valid` accepts.
    pub fn pick_peer_for_transfer(&self, is_valid: impl Fn(&PeerName) -> bool) -> Option<PeerName> {
        self.entries
            .iter()
            .map(|e| &e.owner)
            .find(|owner| **owner != self.peer && is_valid(owner))
            .cloned()
    }

    /// Every peer mentioned on the ring.
    pub fn peer_names(&self) -> BTreeSet<PeerName> {
        self.entries.iter().map(|e| e.owner.clone()).collect()
    }
}

fn span(universe: &Range, entries: &[Entry], i: usize) -> Count {
    let token = entries[i].token;
    let next = entries[(i + 1) % entries.len()].token;
    if next > token {
        token.distance_to(next)
    } else {
        token.distance_to(universe.end) + universe.start.distance_to(next)
    }
}

/// Checks the invariants of a list of entries for the given universe.
fn check_entries(universe: &Range, entries: &[Entry]) -> Result<(), RingError> {
    for entry in entries {
        if !universe.contains(entry.token) {
            return Err(RingError::TokenOutOfRange {
                token: entry.token,
                universe: *universe,
            });
        }
    }
    for (a, b) in entries.iter().tuple_windows() {
        if a.token == b.token {
            return Err(RingError::TokenRepeated(a.token));
        }
        if a.token > b.token {
            return Err(RingError::NotSorted(b.token));
        }
    }
    for (i, entry) in entries.iter().enumerate() {
        let size = span(universe, entries, i);
        if entry.free > size {
            return Err(RingError::TooMuchFree {
                token: entry.token,
                free: entry.free,
                size,
            });
        }
    }
    Ok(())
}

/// Joins adjacent ranges of a sorted list.
fn coalesce(ranges: impl IntoIterator<Item = Range>) -> Vec<Range> {
    ranges
        .into_iter()
        .coalesce(|a, b| {
            if a.end == b.start {
                Ok(Range::new(a.start, b.end))
            } else {
                Err((a, b))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests;
