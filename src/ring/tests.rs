use super::*;
use crate::address::{cidr, ip};
use crate::peer::peer;

fn universe() -> Range {
    cidr("10.0.0.0/24").range()
}

fn dot(n: u32) -> Address {
    ip("10.0.0.0").add(n)
}

fn entry(token: u32, owner: &str, version: u32, free: Count) -> Entry {
    Entry {
        token: dot(token),
        owner: peer(owner),
        version,
        free,
    }
}

fn state(entries: Vec<Entry>) -> RingState {
    RingState {
        universe: universe(),
        entries,
        seeds: vec![],
    }
}

fn ring_with(owner: &str, entries: Vec<Entry>) -> Ring {
    Ring::restore(peer(owner), state(entries)).unwrap()
}

/// Empty ring on `owner` with every state merged in, in order.
fn merged(owner: &str, states: &[&RingState]) -> Ring {
    let mut ring = Ring::new(universe(), peer(owner));
    for s in states {
        ring.merge(s).unwrap();
    }
    ring
}

#[test]
fn claim_for_two_peers_splits_in_half() {
    let mut ring = Ring::new(universe(), peer("P1"));
    ring.claim_for_peers(&[peer("P2"), peer("P1")]);

    assert_eq!(
        ring.entries(),
        &[entry(0, "P1", 0, 128), entry(128, "P2", 0, 128)]
    );
    assert_eq!(ring.seeds(), &[peer("P1"), peer("P2")]);
    assert_eq!(ring.owned_ranges(), vec![Range::new(dot(0), dot(128))]);
}

#[test]
fn claim_for_three_peers() {
    let mut ring = Ring::new(universe(), peer("P1"));
    ring.claim_for_peers(&[peer("P3"), peer("P1"), peer("P2"), peer("P1")]);

    assert_eq!(
        ring.entries(),
        &[
            entry(0, "P1", 0, 128),
            entry(128, "P2", 0, 64),
            entry(192, "P3", 0, 64)
        ]
    );
}

#[test]
#[should_panic]
fn claim_on_non_empty_ring_panics() {
    let mut ring = Ring::new(universe(), peer("P1"));
    ring.claim_for_peers(&[peer("P1")]);
    ring.claim_for_peers(&[peer("P1")]);
}

#[test]
fn grant_splits_our_range() {
    let mut ring = Ring::new(universe(), peer("P1"));
    ring.claim_for_peers(&[peer("P1")]);

    ring.grant_range(dot(10), dot(245), &peer("P2"));

    assert_eq!(
        ring.entries(),
        &[
            entry(0, "P1", 1, 10),
            entry(10, "P2", 0, 235),
            entry(245, "P1", 0, 11)
        ]
    );
    assert_eq!(
        ring.owned_ranges(),
        vec![
            Range::new(dot(0), dot(10)),
            Range::new(dot(245), universe().end)
        ]
    );

    // The receiving side adopts the grant through a merge
    let mut other = Ring::new(universe(), peer("P2"));
    assert!(other.merge(&ring.state()).unwrap());
    assert_eq!(other.entries(), ring.entries());
    assert_eq!(other.owned_ranges(), vec![Range::new(dot(10), dot(245))]);
}

#[test]
fn grant_at_existing_tokens_bumps_versions() {
    let mut ring = Ring::new(universe(), peer("P1"));
    ring.claim_for_peers(&[peer("P1"), peer("P2")]);

    // Lower half of P1's range, token at start already exists
    ring.grant_range(dot(0), dot(64), &peer("P3"));
    assert_eq!(
        ring.entries(),
        &[
            entry(0, "P3", 1, 64),
            entry(64, "P1", 0, 64),
            entry(128, "P2", 0, 128)
        ]
    );

    // Rest of the range, token at end already exists
    ring.grant_range(dot(64), dot(128), &peer("P3"));
    assert_eq!(ring.entries()[1], entry(64, "P3", 1, 64));
    assert!(ring.owned_ranges().is_empty());
}

#[test]
fn grant_up_to_the_end_of_the_universe() {
    let mut ring = ring_with("P2", vec![entry(0, "P1", 0, 128), entry(128, "P2", 0, 128)]);

    ring.grant_range(dot(192), universe().end, &peer("P1"));

    assert_eq!(
        ring.entries(),
        &[
            entry(0, "P1", 0, 128),
            entry(128, "P2", 1, 64),
            entry(192, "P1", 0, 64)
        ]
    );
}

#[test]
#[should_panic]
fn granting_space_we_dont_own_panics() {
    let mut ring = Ring::new(universe(), peer("P1"));
    ring.claim_for_peers(&[peer("P1"), peer("P2")]);
    ring.grant_range(dot(100), dot(150), &peer("P3"));
}

#[test]
fn merge_keeps_higher_versions() {
    // R1 dominates R2 on every token
    let r1 = state(vec![entry(0, "P1", 3, 10), entry(128, "P2", 1, 128)]);
    let r2 = state(vec![entry(0, "P1", 2, 5), entry(128, "P2", 1, 128)]);

    let mut ring = ring_with("P3", r1.entries.clone());
    assert!(!ring.merge(&r2).unwrap());
    assert_eq!(ring.state(), r1);

    assert!(!ring.merge(&r1).unwrap());
    assert_eq!(ring.state(), r1);

    let mut ring = ring_with("P3", r2.entries.clone());
    assert!(ring.merge(&r1).unwrap());
    assert_eq!(ring.state(), r1);
}

#[test]
fn merge_rejects_newer_version_of_our_entry() {
    let mut ring = ring_with("P1", vec![entry(0, "P1", 1, 256)]);
    let before = ring.clone();

    let incoming = state(vec![entry(0, "P3", 2, 256)]);
    assert_eq!(
        ring.merge(&incoming),
        Err(RingError::NewerVersion {
            token: dot(0),
            ours: 1,
            theirs: 2
        })
    );
    assert_eq!(ring, before);
}

#[test]
fn merge_rejects_entry_inside_our_range() {
    let mut ring = ring_with("P1", vec![entry(0, "P1", 0, 100)]);
    let before = ring.clone();

    let incoming = state(vec![entry(0, "P1", 0, 100), entry(128, "P2", 0, 128)]);
    assert_eq!(
        ring.merge(&incoming),
        Err(RingError::EntryInMyRange {
            token: dot(128),
            owner: peer("P2")
        })
    );
    assert_eq!(ring, before);
}

#[test]
fn merge_accepts_entries_after_adopted_ones() {
    // P2 granted [128, 192) to P1 and kept [192, 256)
    let mut ring = ring_with("P1", vec![entry(0, "P1", 0, 128), entry(128, "P2", 0, 128)]);
    let incoming = state(vec![
        entry(0, "P1", 0, 128),
        entry(128, "P1", 1, 64),
        entry(192, "P2", 0, 64),
    ]);

    assert!(ring.merge(&incoming).unwrap());
    assert_eq!(ring.owned_ranges(), vec![Range::new(dot(0), dot(192))]);
}

#[test]
fn merge_rejects_inconsistent_entries() {
    let mut ring = ring_with("P3", vec![entry(0, "P1", 1, 10)]);
    let incoming = state(vec![entry(0, "P2", 1, 10)]);
    assert_eq!(ring.merge(&incoming), Err(RingError::Inconsistent(dot(0))));
}

#[test]
fn merge_rejects_invalid_incoming_rings() {
    let mut ring = Ring::new(universe(), peer("P1"));

    let unsorted = state(vec![entry(128, "P2", 0, 10), entry(0, "P1", 0, 10)]);
    assert_eq!(ring.merge(&unsorted), Err(RingError::NotSorted(dot(0))));

    let repeated = state(vec![entry(0, "P2", 0, 10), entry(0, "P1", 0, 10)]);
    assert_eq!(ring.merge(&repeated), Err(RingError::TokenRepeated(dot(0))));

    let too_much = state(vec![entry(0, "P2", 0, 10), entry(5, "P1", 0, 10)]);
    assert!(matches!(
        ring.merge(&too_much),
        Err(RingError::TooMuchFree { free: 10, size: 5, .. })
    ));

    let mut outside = state(vec![entry(0, "P2", 0, 10)]);
    outside.entries[0].token = ip("10.0.1.0");
    assert!(matches!(
        ring.merge(&outside),
        Err(RingError::TokenOutOfRange { .. })
    ));

    assert!(ring.is_empty());
}

#[test]
fn merge_checks_universe_and_seeds() {
    let mut p1 = Ring::new(universe(), peer("P1"));
    p1.claim_for_peers(&[peer("P1"), peer("P2")]);

    let mut other_universe = Ring::new(cidr("10.0.1.0/24").range(), peer("P2"));
    assert!(matches!(
        other_universe.merge(&p1.state()),
        Err(RingError::DifferentRange { .. })
    ));

    let mut other_seeds = Ring::new(universe(), peer("P3"));
    other_seeds.claim_for_peers(&[peer("P3")]);
    assert!(matches!(
        other_seeds.merge(&p1.state()),
        Err(RingError::DifferentSeeds { .. })
    ));

    // Empty seeds adopt the incoming ones
    let mut empty = Ring::new(universe(), peer("P2"));
    assert!(empty.merge(&p1.state()).unwrap());
    assert_eq!(empty.seeds(), p1.seeds());
}

#[test]
fn merge_is_commutative_associative_and_idempotent() {
    let mut p1 = Ring::new(universe(), peer("P1"));
    p1.claim_for_peers(&[peer("P1"), peer("P2")]);
    let a = p1.state();

    p1.grant_range(dot(64), dot(128), &peer("P3"));
    let b = p1.state();

    let mut p2 = Ring::restore(peer("P2"), a.clone()).unwrap();
    p2.report_free(&BTreeMap::from([(dot(128), 100)]));
    let c = p2.state();

    let ab = merged("P9", &[&a, &b]);
    let ba = merged("P9", &[&b, &a]);
    assert_eq!(ab.state(), ba.state());

    let ab_c = merged("P9", &[&ab.state(), &c]);
    let bc = merged("P9", &[&b, &c]);
    let a_bc = merged("P9", &[&a, &bc.state()]);
    assert_eq!(ab_c.state(), a_bc.state());

    let aa = merged("P9", &[&a, &a]);
    assert_eq!(aa.state(), a);

    assert_eq!(
        ab_c.entries(),
        &[
            entry(0, "P1", 1, 64),
            entry(64, "P3", 0, 64),
            entry(128, "P2", 1, 100)
        ]
    );
}

#[test]
fn owner_lookup() {
    let mut ring = Ring::new(universe(), peer("P1"));
    assert_eq!(ring.owner(dot(5)), None);

    ring.claim_for_peers(&[peer("P1"), peer("P2"), peer("P3")]);
    assert_eq!(ring.owner(dot(5)), Some(&peer("P1")));
    assert_eq!(ring.owner(dot(128)), Some(&peer("P2")));
    assert_eq!(ring.owner(dot(255)), Some(&peer("P3")));
    assert_eq!(ring.owner(ip("10.0.1.0")), None);
    assert!(ring.contains(dot(0)));
    assert!(!ring.contains(ip("9.255.255.255")));
}

#[test]
fn owned_ranges_split_over_zero() {
    let ring = ring_with("P1", vec![entry(64, "P1", 0, 128), entry(192, "P2", 0, 128)]);

    assert_eq!(ring.owned_ranges(), vec![Range::new(dot(64), dot(192))]);
    assert_eq!(
        ring.owned_ranges_of(&peer("P2")),
        vec![
            Range::new(dot(0), dot(64)),
            Range::new(dot(192), universe().end)
        ]
    );
    assert_eq!(ring.all_range_info().len(), 3);
    assert_eq!(ring.all_range_info()[0].owner, peer("P2"));
}

#[test]
fn choose_peers_with_free_space() {
    let mut ring = Ring::new(universe(), peer("P1"));
    ring.claim_for_peers(&[peer("P1"), peer("P2"), peer("P3")]);

    let mut everyone = ring.choose_peers_to_ask_for_space(universe());
    everyone.sort();
    assert_eq!(everyone, vec![peer("P2"), peer("P3")]);

    let in_p2 = ring.choose_peers_to_ask_for_space(Range::new(dot(130), dot(140)));
    assert_eq!(in_p2, vec![peer("P2")]);

    // P2 runs out of space
    let mut p2 = Ring::restore(peer("P2"), ring.state()).unwrap();
    p2.report_free(&BTreeMap::from([(dot(128), 0)]));
    ring.merge(&p2.state()).unwrap();

    assert_eq!(
        ring.choose_peers_to_ask_for_space(universe()),
        vec![peer("P3")]
    );
    assert!(
        ring.choose_peers_to_ask_for_space(Range::new(dot(0), dot(100)))
            .is_empty()
    );
}

#[test]
fn transfer_takes_over_a_peer() {
    let mut ring = Ring::new(universe(), peer("P1"));
    ring.claim_for_peers(&[peer("P1"), peer("P2"), peer("P3")]);

    let gained = ring.transfer(&peer("P2"), &peer("P1"));
    assert_eq!(gained, vec![Range::new(dot(128), dot(192))]);
    assert_eq!(ring.owned_ranges(), vec![Range::new(dot(0), dot(192))]);
    assert_eq!(ring.entries()[1], entry(128, "P1", 1, 64));

    // Nothing left to take the second time
    assert!(ring.transfer(&peer("P2"), &peer("P1")).is_empty());
    assert_eq!(ring.entries()[1].version, 1);
}

#[test]
fn pick_heir_skips_us_and_invalid_peers() {
    let ring = ring_with(
        "P1",
        vec![
            entry(0, "P1", 1, 64),
            entry(64, "P2", 1, 64),
            entry(128, "P3", 1, 128),
        ],
    );

    assert_eq!(ring.pick_peer_for_transfer(|_| true), Some(peer("P2")));
    assert_eq!(
        ring.pick_peer_for_transfer(|p| *p != peer("P2")),
        Some(peer("P3"))
    );
    assert_eq!(ring.pick_peer_for_transfer(|_| false), None);
    assert_eq!(
        ring_with("P1", vec![entry(0, "P1", 1, 256)]).pick_peer_for_transfer(|_| true),
        None
    );
}

#[test]
fn report_free_bumps_versions_only_on_change() {
    let mut ring = Ring::new(universe(), peer("P1"));
    ring.claim_for_peers(&[peer("P1"), peer("P2")]);

    assert!(ring.report_free(&BTreeMap::from([(dot(0), 100)])));
    assert_eq!(ring.entries()[0], entry(0, "P1", 1, 100));
    assert!(!ring.report_free(&BTreeMap::from([(dot(0), 100)])));
    assert_eq!(ring.entries()[0].version, 1);
}

#[test]
#[should_panic]
fn report_free_on_foreign_token_panics() {
    let mut ring = Ring::new(universe(), peer("P1"));
    ring.claim_for_peers(&[peer("P1"), peer("P2")]);
    ring.report_free(&BTreeMap::from([(dot(128), 1)]));
}

#[test]
fn state_round_trips_through_json() {
    let mut ring = Ring::new(universe(), peer("P1"));
    ring.claim_for_peers(&[peer("P1"), peer("P2")]);

    let json = serde_json::to_string(&ring.state()).unwrap();
    let back: RingState = serde_json::from_str(&json).unwrap();
    assert_eq!(Ring::restore(peer("P1"), back).unwrap(), ring);
}
