//! Single-decree Paxos used once, to agree on the peers that split the
//! universe when the ring is still empty.
//!
//! Every node is both proposer and acceptor. Messages a node sends to
//! itself are handled locally and never reach the transport.

use crate::peer::PeerName;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Proposal number. Ordered by round, then by proposer name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ballot {
    pub round: u32,
    pub proposer: PeerName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accepted {
    pub ballot: Ballot,
    pub value: Vec<PeerName>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "camelCase")]
pub enum PaxosMessage {
    Prepare {
        ballot: Ballot,
    },
    Promise {
        ballot: Ballot,
        accepted: Option<Accepted>,
    },
    Propose {
        ballot: Ballot,
        value: Vec<PeerName>,
    },
    Accept {
        ballot: Ballot,
        value: Vec<PeerName>,
    },
    Learned {
        value: Vec<PeerName>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Broadcast(PaxosMessage),
    Unicast(PeerName, PaxosMessage),
}

#[derive(Debug)]
struct Proposal {
    ballot: Ballot,
    promises: BTreeMap<PeerName, Option<Accepted>>,
    value: Option<Vec<PeerName>>,
    accepts: BTreeSet<PeerName>,
}

#[derive(Debug)]
pub struct Node {
    name: PeerName,
    quorum: u32,
    known_peers: BTreeSet<PeerName>,
    max_round: u32,
    promised: Option<Ballot>,
    accepted: Option<Accepted>,
    proposal: Option<Proposal>,
    chosen: Option<Vec<PeerName>>,
}

impl Node {
    pub fn new(name: PeerName, quorum: u32) -> Self {
        let known_peers = BTreeSet::from([name.clone()]);
        Self {
            name,
            quorum: quorum.max(1),
            known_peers,
            max_round: 0,
            promised: None,
            accepted: None,
            proposal: None,
            chosen: None,
        }
    }

    pub fn quorum(&self) -> u32 {
        self.quorum
    }

    pub fn known_peers(&self) -> &BTreeSet<PeerName> {
        &self.known_peers
    }

    pub fn is_proposing(&self) -> bool {
        self.proposal.is_some()
    }

    /// The agreed list of peers, once known.
    pub fn consensus(&self) -> Option<&[PeerName]> {
        self.chosen.as_deref()
    }

    /// Starts a new proposal with a round higher than any seen so far.
    pub fn propose(&mut self) -> Vec<Outbound> {
        if self.chosen.is_some() {
            return Vec::new();
        }
        self.max_round += 1;
        let ballot = Ballot {
            round: self.max_round,
            proposer: self.name.clone(),
        };
        self.proposal = Some(Proposal {
            ballot: ballot.clone(),
            promises: BTreeMap::new(),
            value: None,
            accepts: BTreeSet::new(),
        });
        self.run(vec![Outbound::Broadcast(PaxosMessage::Prepare { ballot })])
    }

    /// Handles a message from another peer. Returns what must be sent.
    pub fn handle(&mut self, from: &PeerName, msg: PaxosMessage) -> Vec<Outbound> {
        self.known_peers.insert(from.clone());
        let out = self.step(from, msg);
        self.run(out)
    }

    /// Delivers our own messages to ourselves until only messages for
    /// other peers are left.
    fn run(&mut self, out: Vec<Outbound>) -> Vec<Outbound> {
        let mut queue: VecDeque<Outbound> = out.into();
        let mut external = Vec::new();
        let me = self.name.clone();

        while let Some(out) = queue.pop_front() {
            match out {
                Outbound::Broadcast(msg) => {
                    external.push(Outbound::Broadcast(msg.clone()));
                    queue.extend(self.step(&me, msg));
                }
                Outbound::Unicast(to, msg) if to == me => queue.extend(self.step(&me, msg)),
                unicast => external.push(unicast),
            }
        }
        external
    }

    fn step(&mut self, from: &PeerName, msg: PaxosMessage) -> Vec<Outbound> {
        match msg {
            PaxosMessage::Prepare { ballot } => {
                if let Some(value) = &self.chosen {
                    return vec![Outbound::Unicast(
                        from.clone(),
                        PaxosMessage::Learned {
                            value: value.clone(),
                        },
                    )];
                }
                self.max_round = self.max_round.max(ballot.round);
                if self.promised.as_ref().is_some_and(|p| ballot <= *p) {
                    return Vec::new();
                }
                self.promised = Some(ballot.clone());
                vec![Outbound::Unicast(
                    ballot.proposer.clone(),
                    PaxosMessage::Promise {
                        ballot,
                        accepted: self.accepted.clone(),
                    },
                )]
            }
            PaxosMessage::Promise { ballot, accepted } => {
                let fallback: Vec<PeerName> = self.known_peers.iter().cloned().collect();
                let quorum = self.quorum as usize;
                let Some(proposal) = self.proposal.as_mut() else {
                    return Vec::new();
                };
                if proposal.ballot != ballot || proposal.value.is_some() {
                    return Vec::new();
                }
                proposal.promises.insert(from.clone(), accepted);
                if proposal.promises.len() < quorum {
                    return Vec::new();
                }

                // Must propose the value of the highest accepted ballot, if any
                let value = proposal
                    .promises
                    .values()
                    .flatten()
                    .max_by(|a, b| a.ballot.cmp(&b.ballot))
                    .map(|a| a.value.clone())
                    .unwrap_or(fallback);
                proposal.value = Some(value.clone());
                vec![Outbound::Broadcast(PaxosMessage::Propose { ballot, value })]
            }
            PaxosMessage::Propose { ballot, value } => {
                self.max_round = self.max_round.max(ballot.round);
                if self.promised.as_ref().is_some_and(|p| ballot < *p) {
                    return Vec::new();
                }
                self.promised = Some(ballot.clone());
                self.accepted = Some(Accepted {
                    ballot: ballot.clone(),
                    value: value.clone(),
                });
                vec![Outbound::Unicast(
                    ballot.proposer.clone(),
                    PaxosMessage::Accept { ballot, value },
                )]
            }
            PaxosMessage::Accept { ballot, value } => {
                let Some(proposal) = self.proposal.as_mut() else {
                    return Vec::new();
                };
                if proposal.ballot != ballot || proposal.value.as_ref() != Some(&value) {
                    return Vec::new();
                }
                proposal.accepts.insert(from.clone());
                if proposal.accepts.len() < self.quorum as usize || self.chosen.is_some() {
                    return Vec::new();
                }
                self.chosen = Some(value.clone());
                vec![Outbound::Broadcast(PaxosMessage::Learned { value })]
            }
            PaxosMessage::Learned { value } => {
                if self.chosen.is_none() {
                    self.chosen = Some(value);
                }
                Vec::new()
            }
        }
    }
}

/// Majority of the expected cluster size.
pub fn quorum_for(cluster_size: u32) -> u32 {
    cluster_size / 2 + 1
}
