use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;

/// Name of a peer in the cluster. Names are compared as plain strings, so
/// `P1 < P2 < P3`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerName(String);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PeerNameError {
    #[error("peer name must not be empty")]
    Empty,
    #[error("peer name '{0}' contains a reserved character")]
    Reserved(String),
}

impl PeerName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerName {
    type Err = PeerNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PeerNameError::Empty);
        }
        // ',' and '=' separate entries in IPAM_MODE and IPAM_GOSSIP_PEERS
        if s.contains([',', '=', '/']) || s.chars().any(char::is_whitespace) {
            return Err(PeerNameError::Reserved(s.to_string()));
        }
        Ok(PeerName(s.to_string()))
    }
}

#[cfg(test)]
pub fn peer(name: &str) -> PeerName {
    name.parse().unwrap()
}
