use crate::address::{Address, Cidr, Range};
use crate::allocator::Owned;
use crate::peer::PeerName;
use crate::ring::{Entry, Ring, RingState};
use crate::store::Store;
use anyhow::{Context, Result, bail};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const SCHEMA_VERSION: u32 = 1;
pub const STORE_KEY: &str = "ipam";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedAllocation {
    pub identity: String,
    pub addr: Address,
    pub prefix_len: u8,
    pub is_container: bool,
}

/// Everything written to the store, under a single key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub schema_version: u32,
    pub own_name: PeerName,
    pub universe: Range,
    pub ring: Vec<Entry>,
    pub seeds: Vec<PeerName>,
    #[serde(default)]
    pub nicknames: BTreeMap<PeerName, String>,
    pub allocations: Vec<PersistedAllocation>,
}

impl PersistedState {
    pub fn capture(
        own_name: &PeerName,
        ring: &Ring,
        owned: &BTreeMap<String, Owned>,
        nicknames: &BTreeMap<PeerName, String>,
    ) -> Self {
        let ring_state = ring.state();
        let allocations = owned
            .iter()
            .flat_map(|(identity, data)| {
                data.cidrs.iter().map(move |cidr| PersistedAllocation {
                    identity: identity.clone(),
                    addr: cidr.addr,
                    prefix_len: cidr.prefix_len,
                    is_container: data.is_container,
                })
            })
            .collect();

        Self {
            schema_version: SCHEMA_VERSION,
            own_name: own_name.clone(),
            universe: ring_state.universe,
            ring: ring_state.entries,
            seeds: ring_state.seeds,
            nicknames: nicknames.clone(),
            allocations,
        }
    }

    pub fn ring_state(&self) -> RingState {
        RingState {
            universe: self.universe,
            entries: self.ring.clone(),
            seeds: self.seeds.clone(),
        }
    }

    pub fn owned(&self) -> Result<BTreeMap<String, Owned>> {
        let mut owned: BTreeMap<String, Owned> = BTreeMap::new();
        for a in &self.allocations {
            let cidr = Cidr::new(a.addr, a.prefix_len)
                .with_context(|| format!("persisted allocation of {} for {}", a.addr, a.identity))?;
            let data = owned.entry(a.identity.clone()).or_insert_with(|| Owned {
                is_container: a.is_container,
                cidrs: Vec::new(),
            });
            data.cidrs.push(cidr);
        }
        Ok(owned)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    schema_version: u32,
}

/// Reads persisted state. Data written by another peer name or for another
/// universe is ignored, and will be overwritten by the next save.
pub fn load(
    store: &dyn Store,
    own_name: &PeerName,
    universe: Range,
) -> Result<Option<PersistedState>> {
    let Some(bytes) = store.get(STORE_KEY)? else {
        return Ok(None);
    };

    let envelope: Envelope =
        serde_json::from_slice(&bytes).context("reading persisted IPAM data")?;
    if envelope.schema_version != SCHEMA_VERSION {
        bail!(
            "persisted IPAM data has schema version {}, only {} is supported",
            envelope.schema_version,
            SCHEMA_VERSION
        );
    }

    let state: PersistedState =
        serde_json::from_slice(&bytes).context("reading persisted IPAM data")?;
    if state.own_name != *own_name {
        warn!(
            "deleting persisted IPAM data of peer {}, we are {own_name}",
            state.own_name
        );
        return Ok(None);
    }
    if state.universe != universe {
        warn!(
            "deleting persisted IPAM data for universe {}, ours is {universe}",
            state.universe
        );
        return Ok(None);
    }
    Ok(Some(state))
}

pub fn save(store: &mut dyn Store, state: &PersistedState) -> Result<()> {
    let bytes = serde_json::to_vec(state).context("encoding IPAM state")?;
    store.put(STORE_KEY, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{cidr, ip};
    use crate::peer::peer;
    use crate::store::testing::MemoryStore;

    fn sample() -> PersistedState {
        let mut ring = Ring::new(cidr("10.0.0.0/24").range(), peer("P1"));
        ring.claim_for_peers(&[peer("P1"), peer("P2")]);
        let owned = BTreeMap::from([(
            "c1".to_string(),
            Owned {
                is_container: true,
                cidrs: vec![cidr("10.0.0.1/24")],
            },
        )]);
        PersistedState::capture(&peer("P1"), &ring, &owned, &BTreeMap::new())
    }

    #[test]
    fn saves_and_loads() -> Result<()> {
        let mut store = MemoryStore::new();
        let state = sample();
        save(&mut store, &state)?;

        let loaded = load(&store, &peer("P1"), cidr("10.0.0.0/24").range())?;
        assert_eq!(loaded.as_ref(), Some(&state));

        let owned = state.owned()?;
        assert_eq!(owned["c1"].cidrs, vec![cidr("10.0.0.1/24")]);
        assert_eq!(state.allocations[0].addr, ip("10.0.0.1"));
        Ok(())
    }

    #[test]
    fn ignores_data_of_other_peers_and_universes() -> Result<()> {
        let mut store = MemoryStore::new();
        save(&mut store, &sample())?;

        assert_eq!(load(&store, &peer("P2"), cidr("10.0.0.0/24").range())?, None);
        assert_eq!(load(&store, &peer("P1"), cidr("10.0.1.0/24").range())?, None);
        Ok(())
    }

    #[test]
    fn refuses_unknown_schema_versions() -> Result<()> {
        let mut store = MemoryStore::new();
        let mut state = sample();
        state.schema_version = 99;
        save(&mut store, &state)?;

        let err = load(&store, &peer("P1"), cidr("10.0.0.0/24").range()).unwrap_err();
        assert!(err.to_string().contains("schema version 99"));
        Ok(())
    }

    #[test]
    fn layout_uses_camel_case_keys() -> Result<()> {
        let json: serde_json::Value = serde_json::to_value(sample())?;
        assert_eq!(json["schemaVersion"], 1);
        assert_eq!(json["ownName"], "P1");
        assert_eq!(json["allocations"][0]["prefixLen"], 24);
        assert_eq!(json["ring"][1]["token"], "10.0.0.128");
        Ok(())
    }
}
