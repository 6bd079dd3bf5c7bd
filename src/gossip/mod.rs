pub mod http;
mod messages;

pub use messages::GossipMessage;

use crate::peer::PeerName;
use anyhow::Result;

/// Version byte in front of every encoded message.
pub const WIRE_VERSION: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty gossip message")]
    Empty,
    #[error("unsupported gossip wire version {0}")]
    UnknownVersion(u8),
    #[error("malformed gossip message: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub fn encode(msg: &GossipMessage) -> Result<Vec<u8>, DecodeError> {
    let mut bytes = vec![WIRE_VERSION];
    serde_json::to_writer(&mut bytes, msg)?;
    Ok(bytes)
}

pub fn decode(bytes: &[u8]) -> Result<GossipMessage, DecodeError> {
    let (&version, payload) = bytes.split_first().ok_or(DecodeError::Empty)?;
    if version != WIRE_VERSION {
        return Err(DecodeError::UnknownVersion(version));
    }
    Ok(serde_json::from_slice(payload)?)
}

/// Transport used by the allocator. Implementations must deliver messages
/// between a pair of peers in the order they were sent, and must not block.
pub trait Gossip: Send {
    fn gossip_unicast(&self, to: &PeerName, msg: Vec<u8>) -> Result<()>;
    fn gossip_broadcast(&self, msg: Vec<u8>) -> Result<()>;
    fn is_known_peer(&self, name: &PeerName) -> bool;
}

/// Transport for a peer with nobody to talk to.
pub struct NoGossip;

impl Gossip for NoGossip {
    fn gossip_unicast(&self, to: &PeerName, _msg: Vec<u8>) -> Result<()> {
        anyhow::bail!("no route to {to}")
    }

    fn gossip_broadcast(&self, _msg: Vec<u8>) -> Result<()> {
        Ok(())
    }

    fn is_known_peer(&self, _name: &PeerName) -> bool {
        false
    }
}
