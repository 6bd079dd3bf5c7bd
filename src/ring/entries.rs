use crate::address::{Address, Count};
use crate::peer::PeerName;
use crate::ring::RingError;
use serde::{Deserialize, Serialize};

/// One token on the ring. It owns addresses from `token` up to the next
/// entry's token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub token: Address,
    pub owner: PeerName,
    pub version: u32,
    /// Free addresses advertised by the owner, only a hint
    pub free: Count,
}

impl Entry {
    pub fn new(token: Address, owner: PeerName, free: Count) -> Self {
        Self {
            token,
            owner,
            version: 0,
            free,
        }
    }

    pub(super) fn update(&mut self, owner: PeerName, free: Count) {
        self.owner = owner;
        self.free = free;
        self.version += 1;
    }
}

/// Sorted list of entries. Indexing through `entry` wraps around.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(super) struct Entries(pub(super) Vec<Entry>);

impl Entries {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn entry(&self, i: usize) -> &Entry {
        &self.0[i % self.0.len()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.0.iter()
    }

    /// Position of `token` if present, otherwise where it would be inserted.
    pub fn find(&self, token: Address) -> Result<usize, usize> {
        self.0.binary_search_by_key(&token, |e| e.token)
    }

    /// Index of the entry whose range contains `addr`.
    pub fn covering(&self, addr: Address) -> usize {
        match self.find(addr) {
            Ok(i) => i,
            Err(0) => self.0.len() - 1,
            Err(i) => i - 1,
        }
    }

    /// Panics if the token is already present.
    pub fn insert(&mut self, entry: Entry) -> usize {
        match self.find(entry.token) {
            Ok(_) => panic!("token {} already present on the ring", entry.token),
            Err(i) => {
                self.0.insert(i, entry);
                i
            }
        }
    }

    /// Two-pointer merge of `other` into these entries, from the point of
    /// view of `our_peer`. Returns the merged list and whether it differs
    /// from ours.
    pub fn merge(&self, other: &[Entry], our_peer: &PeerName) -> Result<(Vec<Entry>, bool), RingError> {
        let mine = &self.0;
        let mut result = Vec::with_capacity(mine.len().max(other.len()));
        let mut updated = false;
        // Owner of the last entry taken from our side. Cleared whenever we
        // adopt one of theirs.
        let mut previous_owner: Option<&PeerName> = None;

        let (mut i, mut j) = (0, 0);
        while i < mine.len() && j < other.len() {
            let (ours, theirs) = (&mine[i], &other[j]);
            match ours.token.cmp(&theirs.token) {
                std::cmp::Ordering::Less => {
                    result.push(ours.clone());
                    previous_owner = Some(&ours.owner);
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    check_not_in_my_range(theirs, previous_owner, our_peer)?;
                    result.push(theirs.clone());
                    previous_owner = None;
                    updated = true;
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    if ours.version > theirs.version {
                        result.push(ours.clone());
                        previous_owner = Some(&ours.owner);
                    } else if ours.version == theirs.version {
                        if ours != theirs {
                            return Err(RingError::Inconsistent(ours.token));
                        }
                        result.push(ours.clone());
                        previous_owner = Some(&ours.owner);
                    } else {
                        if ours.owner == *our_peer {
                            return Err(RingError::NewerVersion {
                                token: ours.token,
                                ours: ours.version,
                                theirs: theirs.version,
                            });
                        }
                        previous_owner = None;
                        result.push(theirs.clone());
                        updated = true;
                    }
                    i += 1;
                    j += 1;
                }
            }
        }

        result.extend(mine[i..].iter().cloned());
        for theirs in &other[j..] {
            check_not_in_my_range(theirs, previous_owner, our_peer)?;
            result.push(theirs.clone());
            previous_owner = None;
            updated = true;
        }

        Ok((result, updated))
    }
}

/// A remote peer must not place a token inside a range we own.
fn check_not_in_my_range(
    theirs: &Entry,
    previous_owner: Option<&PeerName>,
    our_peer: &PeerName,
) -> Result<(), RingError> {
    if previous_owner == Some(our_peer) && theirs.owner != *our_peer {
        return Err(RingError::EntryInMyRange {
            token: theirs.token,
            owner: theirs.owner.clone(),
        });
    }
    Ok(())
}
