//! Pre-builds consistent routing state for a whole ring at once.
//!
//! Rather than joining nodes one by one, a test or simulation can hand the
//! full key population to [build_states] and get back a routing table and
//! leaf set per node that already satisfy the prefix and neighbor
//! invariants. Routing table picks among equally valid candidates are
//! randomized through the caller's rng so different seeds exercise
//! different tables.

use petal_api::*;

/// The bootstrap state for one node.
#[derive(Debug, Clone)]
pub struct NodeState {
    /// The node's key.
    pub key: NodeKey,
    /// A routing table satisfying the prefix invariant over the given
    /// population.
    pub table: RoutingTable,
    /// A leaf set holding the node's nearest ring neighbors on both sides.
    pub leaf_set: LeafSet,
}

/// Build bootstrap state for every key in `keys`.
///
/// Keys must be distinct. The slice order does not matter.
pub fn build_states<R: rand::Rng>(
    ring: &RingConfig,
    keys: &[NodeKey],
    rng: &mut R,
) -> PetalResult<Vec<NodeState>> {
    ring.validate()?;
    let mut sorted = keys.to_vec();
    sorted.sort();
    if sorted.windows(2).any(|w| w[0] == w[1]) {
        return Err(PetalError::other("bootstrap keys must be distinct"));
    }
    let out = sorted
        .iter()
        .map(|key| {
            let mut table = RoutingTable::new(ring);
            fill_level(&mut table, *key, ring, rng, &sorted, 0);
            NodeState {
                key: *key,
                table,
                leaf_set: build_leaf_set(*key, ring, &sorted),
            }
        })
        .collect();
    Ok(out)
}

// `group` is the sorted run of keys sharing the owner's first `level`
// digits. Each sub-run by the digit at `level` contributes one randomly
// chosen routing entry, except the owner's own sub-run, which is descended
// into instead (the owner's own cell in a row stays empty).
fn fill_level<R: rand::Rng>(
    table: &mut RoutingTable,
    owner: NodeKey,
    ring: &RingConfig,
    rng: &mut R,
    group: &[NodeKey],
    level: usize,
) {
    if level >= table.rows() || group.len() <= 1 {
        return;
    }
    let own_digit = owner.digit_at(level, ring);
    let mut start = 0;
    while start < group.len() {
        let digit = group[start].digit_at(level, ring);
        let mut end = start;
        while end < group.len() && group[end].digit_at(level, ring) == digit
        {
            end += 1;
        }
        let run = &group[start..end];
        if digit == own_digit {
            fill_level(table, owner, ring, rng, run, level + 1);
        } else {
            let pick = run[rng.gen_range(0..run.len())];
            table.set(level, digit, Some(pick));
        }
        start = end;
    }
}

// Walk up to `half_leaf` successors clockwise and predecessors
// counter-clockwise along the sorted population. The sided inserts resolve
// wraparound at the ring seam and refuse cross-side duplicates, which
// makes small populations (fewer others than slots) come out right
// without a special case.
fn build_leaf_set(
    owner: NodeKey,
    ring: &RingConfig,
    sorted: &[NodeKey],
) -> LeafSet {
    let mut ls = LeafSet::new(owner, ring);
    let sz = sorted.len();
    let pos = sorted
        .iter()
        .position(|k| *k == owner)
        .unwrap_or_default();
    for i in 1..=ring.half_leaf().min(sz.saturating_sub(1)) {
        ls.push_to_right(sorted[(pos + i) % sz]);
        ls.push_to_left(sorted[(pos + sz - i) % sz]);
    }
    ls
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::SeedableRng;

    fn ring() -> RingConfig {
        RingConfig::new(4, 8).unwrap()
    }

    fn build(count: u64) -> Vec<NodeState> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(count);
        let keys: Vec<NodeKey> =
            (0..count).map(|_| NodeKey::random(&mut rng)).collect();
        build_states(&ring(), &keys, &mut rng).unwrap()
    }

    #[test]
    fn routing_tables_satisfy_the_prefix_invariant() {
        let ring = ring();
        let states = build(64);
        let population: Vec<NodeKey> =
            states.iter().map(|s| s.key).collect();
        for state in &states {
            for (row, col, entry) in state.table.entries() {
                assert_ne!(state.key, entry);
                assert!(population.contains(&entry));
                assert_eq!(row, state.key.prefix_len(&entry, &ring));
                assert_eq!(col, entry.digit_at(row, &ring));
            }
        }
    }

    #[test]
    fn first_rows_cover_every_present_digit() {
        let ring = ring();
        let states = build(256);
        // with 256 random keys every first-digit value is present with
        // overwhelming probability, so row zero should be full apart from
        // the owner's own digit
        for state in &states {
            for digit in 0..ring.base() {
                if digit == state.key.digit_at(0, &ring) {
                    assert_eq!(None, state.table.get(0, digit));
                } else {
                    assert!(state.table.get(0, digit).is_some());
                }
            }
        }
    }

    #[test]
    fn leaf_sets_hold_ring_neighbors() {
        let states = build(64);
        let sorted: Vec<NodeKey> = states.iter().map(|s| s.key).collect();
        let h = ring().half_leaf();
        let sz = sorted.len();
        for (pos, state) in states.iter().enumerate() {
            let ls = &state.leaf_set;
            assert!(!ls.need_repair_left());
            assert!(!ls.need_repair_right());
            for i in 1..=h {
                assert!(ls.contains(&sorted[(pos + i) % sz]));
                assert!(ls.contains(&sorted[(pos + sz - i) % sz]));
            }
            assert_eq!(sorted[(pos + h) % sz], ls.max());
            assert_eq!(sorted[(pos + sz - h) % sz], ls.min());
        }
    }

    #[test]
    fn small_population_fills_what_it_can() {
        let states = build(3);
        for state in &states {
            let others = state.leaf_set.list_all_nodes();
            assert_eq!(2, others.len());
            assert!(!others.contains(&state.key));
        }
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let keys = vec![NodeKey(7), NodeKey(9), NodeKey(7)];
        assert!(build_states(&ring(), &keys, &mut rng).is_err());
    }
}
