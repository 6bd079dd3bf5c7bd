use crate::address::{Count, Range};
use crate::paxos::PaxosMessage;
use crate::peer::PeerName;
use crate::ring::RingState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Everything allocators say to each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GossipMessage {
    /// Full ring of the sender, plus the nicknames it knows.
    RingUpdate {
        ring: RingState,
        nicknames: BTreeMap<PeerName, String>,
    },
    /// Asks the receiver to donate free space inside `range`.
    #[serde(rename_all = "camelCase")]
    SpaceRequest { range: Range, amount_hint: Count },
    /// Answer to a space request; `granted` is empty when nothing was given.
    SpaceResponse {
        requested: Range,
        granted: Option<Range>,
    },
    /// Sent by peers without a ring to get one from whoever has it.
    RingRequest,
    Paxos(PaxosMessage),
}

impl GossipMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            GossipMessage::RingUpdate { .. } => "ring update",
            GossipMessage::SpaceRequest { .. } => "space request",
            GossipMessage::SpaceResponse { .. } => "space response",
            GossipMessage::RingRequest => "ring request",
            GossipMessage::Paxos(_) => "paxos",
        }
    }
}
