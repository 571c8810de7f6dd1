//! The leaf set: a node's nearest ring neighbors on both sides.

use crate::{NodeKey, RingConfig};

/// The nearest known neighbors of one node on the key ring, pivoted on
/// that node's own key.
///
/// `left` holds up to `L/2` keys counter-clockwise of the pivot (closest
/// first), `right` up to `L/2` keys clockwise (closest first). Near the
/// numeric extremes of the key space a side wraps past the top of the ring
/// back to zero, so "below" and "above" are ring arcs, not plain numeric
/// comparisons.
///
/// All mutators are silent no-ops on invalid input (the pivot itself, a
/// duplicate, a key farther than every held entry) so callers may push
/// speculative candidates cheaply.
///
/// A whole leaf set travels inside join-reply messages, which is why it
/// lives here with the other wire-visible types.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LeafSet {
    pivot: NodeKey,
    hsize: usize,
    left: Vec<Option<NodeKey>>,
    right: Vec<Option<NodeKey>>,
}

impl LeafSet {
    /// Construct an empty leaf set pivoted on `pivot`, sized for the ring's
    /// configured leaf count.
    pub fn new(pivot: NodeKey, config: &RingConfig) -> Self {
        let hsize = config.half_leaf();
        Self {
            pivot,
            hsize,
            left: vec![None; hsize],
            right: vec![None; hsize],
        }
    }

    /// The pivot key this set is organized around.
    pub fn pivot(&self) -> NodeKey {
        self.pivot
    }

    /// Repoint this set at a new pivot.
    ///
    /// Used by a joiner adopting the leaf set received in a join reply.
    /// Entries are not re-sorted; the probe exchange and the cleaning
    /// service converge the contents afterward.
    pub fn set_pivot(&mut self, pivot: NodeKey) {
        self.pivot = pivot;
    }

    /// Entries held per side when full.
    pub fn half_size(&self) -> usize {
        self.hsize
    }

    /// Insert `key` on whichever side of the pivot it falls.
    ///
    /// Away from the wraparound seam this is a plain numeric comparison
    /// against the pivot. When the shorter arc between `key` and the pivot
    /// crosses the top of the ring, plain comparison misclassifies the
    /// side, so the choice falls back to ring-distance comparison against
    /// the set's current extreme entries.
    pub fn push(&mut self, key: NodeKey) {
        if key == self.pivot {
            return;
        }
        if self.in_critical_interval(&key) {
            let to_right = key.ring_distance(&self.max());
            let to_left = key.ring_distance(&self.min());
            if to_right < to_left {
                self.push_to_right(key);
            } else if to_left < to_right {
                self.push_to_left(key);
            } else if self.pivot.clockwise_distance(&key)
                <= key.clockwise_distance(&self.pivot)
            {
                // degenerate edges (usually an empty set): place by which
                // arc from the pivot actually reaches the key first
                self.push_to_right(key);
            } else {
                self.push_to_left(key);
            }
        } else if key > self.pivot {
            self.push_to_right(key);
        } else {
            self.push_to_left(key);
        }
    }

    // True when the shorter arc from the pivot to `key` wraps past the
    // top of the key space.
    fn in_critical_interval(&self, key: &NodeKey) -> bool {
        key.ring_distance(&self.pivot) < key.distance(&self.pivot)
    }

    /// Insertion-sort `key` into the clockwise side if it is closer to the
    /// pivot than some held (or empty) slot. The farthest entry is shifted
    /// out when the side is full.
    pub fn push_to_right(&mut self, key: NodeKey) {
        if key == self.pivot || self.contains(&key) {
            return;
        }
        if let Some(index) = self.correct_right_position(&key) {
            Self::shift(&mut self.right, index);
            self.right[index] = Some(key);
        }
    }

    /// Counter-clockwise counterpart of [LeafSet::push_to_right].
    pub fn push_to_left(&mut self, key: NodeKey) {
        if key == self.pivot || self.contains(&key) {
            return;
        }
        if let Some(index) = self.correct_left_position(&key) {
            Self::shift(&mut self.left, index);
            self.left[index] = Some(key);
        }
    }

    // Insertion index on the right side, or None when the key must not be
    // inserted (duplicate, or farther than a full side).
    //
    // Entries greater than the pivot sort ascending; entries that wrapped
    // past the top of the ring (numerically below the pivot) sort after
    // every un-wrapped entry.
    fn correct_right_position(&self, n: &NodeKey) -> Option<usize> {
        if *n > self.pivot {
            for (i, slot) in self.right.iter().enumerate() {
                let e = match slot {
                    None => return Some(i),
                    Some(e) => e,
                };
                if e == n {
                    return None;
                }
                if *e > *n && *e > self.pivot {
                    return Some(i);
                }
                if *e < *n && *e < self.pivot {
                    return Some(i);
                }
            }
            None
        } else {
            // n itself reaches the right side only by wrapping
            for (i, slot) in self.right.iter().enumerate() {
                let e = match slot {
                    None => return Some(i),
                    Some(e) => e,
                };
                if e == n {
                    return None;
                }
                if *e > *n && *e < self.pivot {
                    return Some(i);
                }
            }
            None
        }
    }

    // Mirror of correct_right_position. The wrapped branch intentionally
    // mirrors the reference behavior, including its narrower condition.
    fn correct_left_position(&self, n: &NodeKey) -> Option<usize> {
        if *n < self.pivot {
            for (i, slot) in self.left.iter().enumerate() {
                let e = match slot {
                    None => return Some(i),
                    Some(e) => e,
                };
                if e == n {
                    return None;
                }
                if *e < *n && *e < self.pivot {
                    return Some(i);
                }
                if *e > *n && *e > self.pivot {
                    return Some(i);
                }
            }
            None
        } else {
            for (i, slot) in self.left.iter().enumerate() {
                let e = match slot {
                    None => return Some(i),
                    Some(e) => e,
                };
                if e == n {
                    return None;
                }
                if *e < *n && *e > self.pivot {
                    return Some(i);
                }
            }
            None
        }
    }

    // Open slot `pos` by shifting later entries one place outward; the
    // farthest entry falls off the end.
    fn shift(side: &mut [Option<NodeKey>], pos: usize) {
        for i in (pos + 1..side.len()).rev() {
            side[i] = side[i - 1];
        }
    }

    /// Remove `key` from whichever side holds it, compacting that side so
    /// held entries stay a contiguous prefix. Returns whether anything was
    /// removed.
    pub fn remove_node_id(&mut self, key: &NodeKey) -> bool {
        for side in [&mut self.right, &mut self.left] {
            if let Some(pos) = side.iter().position(|e| e.as_ref() == Some(key))
            {
                for i in pos..side.len() - 1 {
                    side[i] = side[i + 1];
                }
                let last = side.len() - 1;
                side[last] = None;
                return true;
            }
        }
        false
    }

    /// True if `key` is held on either side.
    pub fn contains(&self, key: &NodeKey) -> bool {
        self.left
            .iter()
            .chain(self.right.iter())
            .any(|e| e.as_ref() == Some(key))
    }

    /// The counter-clockwise extreme of the covered arc (the farthest left
    /// entry), or the pivot itself when the left side is empty.
    pub fn min(&self) -> NodeKey {
        self.left
            .iter()
            .take_while(|e| e.is_some())
            .last()
            .and_then(|e| *e)
            .unwrap_or(self.pivot)
    }

    /// The clockwise extreme of the covered arc, or the pivot when the
    /// right side is empty.
    pub fn max(&self) -> NodeKey {
        self.right
            .iter()
            .take_while(|e| e.is_some())
            .last()
            .and_then(|e| *e)
            .unwrap_or(self.pivot)
    }

    /// True iff `key` lies on the ring arc from [LeafSet::min] to
    /// [LeafSet::max] passing through the pivot. The pivot's own key
    /// always satisfies this.
    pub fn encompass(&self, key: &NodeKey) -> bool {
        if *key == self.pivot {
            return true;
        }
        let lo = self.min();
        let hi = self.max();
        lo.clockwise_distance(key) <= lo.clockwise_distance(&hi)
    }

    /// True iff the left side has an empty slot to refill.
    pub fn need_repair_left(&self) -> bool {
        self.left.iter().any(Option::is_none)
    }

    /// True iff the right side has an empty slot to refill.
    pub fn need_repair_right(&self) -> bool {
        self.right.iter().any(Option::is_none)
    }

    /// Snapshot of every held key, left side ascending toward the pivot
    /// then right side ascending away from it. The pivot is excluded.
    pub fn list_all_nodes(&self) -> Vec<NodeKey> {
        let mut out: Vec<NodeKey> = self
            .left
            .iter()
            .take_while(|e| e.is_some())
            .flatten()
            .copied()
            .collect();
        out.reverse();
        out.extend(self.right.iter().take_while(|e| e.is_some()).flatten());
        out
    }
}

impl std::fmt::Display for LeafSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fmt_side = |side: &[Option<NodeKey>]| {
            side.iter()
                .flatten()
                .map(NodeKey::short)
                .collect::<Vec<_>>()
                .join(";")
        };
        write!(
            f,
            "[{}]{{{}}}[{}]",
            fmt_side(&self.left),
            self.pivot.short(),
            fmt_side(&self.right)
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ls(pivot: u128, l: usize) -> LeafSet {
        LeafSet::new(NodeKey(pivot), &RingConfig::new(4, l).unwrap())
    }

    fn keys(set: &LeafSet) -> Vec<u128> {
        set.list_all_nodes().into_iter().map(|k| k.0).collect()
    }

    #[test]
    fn push_sorts_by_closeness() {
        let mut s = ls(100, 4);
        s.push(NodeKey(130));
        s.push(NodeKey(110));
        s.push(NodeKey(90));
        s.push(NodeKey(70));
        // left ascending then right ascending
        assert_eq!(vec![70, 90, 110, 130], keys(&s));
    }

    #[test]
    fn bounded_sides_discard_farthest() {
        let mut s = ls(100, 4);
        s.push(NodeKey(110));
        s.push(NodeKey(120));
        s.push(NodeKey(105));
        // right holds two entries, 120 was shifted out
        assert_eq!(vec![105, 110], keys(&s));
    }

    #[test]
    fn pivot_and_duplicates_are_noops() {
        let mut s = ls(100, 4);
        s.push(NodeKey(100));
        s.push(NodeKey(110));
        s.push(NodeKey(110));
        s.push_to_left(NodeKey(110));
        assert_eq!(vec![110], keys(&s));
    }

    #[test]
    fn right_side_wraps_at_ring_top() {
        let mut s = ls(u128::MAX - 10, 4);
        s.push(NodeKey(u128::MAX - 5));
        s.push(NodeKey(3));
        // 3 is clockwise of the pivot even though numerically tiny
        assert_eq!(NodeKey(3), s.max());
        assert!(!s.need_repair_right());
        assert_eq!(vec![u128::MAX - 5, 3], keys(&s));
    }

    #[test]
    fn left_side_wraps_at_ring_bottom() {
        let mut s = ls(10, 4);
        s.push(NodeKey(5));
        s.push(NodeKey(u128::MAX - 2));
        // MAX-2 is counter-clockwise of pivot 10 across the seam
        assert_eq!(NodeKey(u128::MAX - 2), s.min());
        assert_eq!(vec![u128::MAX - 2, 5], keys(&s));
    }

    #[test]
    fn wrapped_entries_sort_after_unwrapped_on_right() {
        let mut s = ls(u128::MAX - 100, 8);
        s.push_to_right(NodeKey(7));
        s.push_to_right(NodeKey(u128::MAX - 50));
        s.push_to_right(NodeKey(2));
        assert_eq!(vec![u128::MAX - 50, 2, 7], keys(&s));
    }

    #[test]
    fn first_seam_push_lands_on_its_ring_side() {
        // nothing held yet, so both edges degenerate to the pivot; the
        // side must still follow the shorter arc from the pivot
        let mut s = ls(10, 4);
        s.push(NodeKey(u128::MAX - 2));
        assert_eq!(NodeKey(u128::MAX - 2), s.min());
        assert_eq!(NodeKey(10), s.max());

        let mut s = ls(u128::MAX - 10, 4);
        s.push(NodeKey(3));
        assert_eq!(NodeKey(3), s.max());
        assert_eq!(NodeKey(u128::MAX - 10), s.min());
    }

    #[test]
    fn remove_compacts_and_reports() {
        let mut s = ls(100, 8);
        for k in [90, 80, 70, 110, 120] {
            s.push(NodeKey(k));
        }
        assert!(s.remove_node_id(&NodeKey(80)));
        assert!(!s.remove_node_id(&NodeKey(80)));
        assert_eq!(vec![70, 90, 110, 120], keys(&s));
        // vacated tail slot is empty again
        assert!(s.need_repair_left());
    }

    #[test]
    fn need_repair_tracks_empty_slots() {
        let mut s = ls(100, 4);
        assert!(s.need_repair_left());
        assert!(s.need_repair_right());
        s.push(NodeKey(90));
        s.push(NodeKey(80));
        s.push(NodeKey(110));
        s.push(NodeKey(120));
        assert!(!s.need_repair_left());
        assert!(!s.need_repair_right());
    }

    #[test]
    fn encompass_is_inclusive_and_wrap_aware() {
        let mut s = ls(100, 4);
        s.push(NodeKey(90));
        s.push(NodeKey(120));
        assert!(s.encompass(&NodeKey(90)));
        assert!(s.encompass(&NodeKey(100)));
        assert!(s.encompass(&NodeKey(120)));
        assert!(s.encompass(&NodeKey(115)));
        assert!(!s.encompass(&NodeKey(89)));
        assert!(!s.encompass(&NodeKey(121)));
    }

    #[test]
    fn encompass_across_the_seam() {
        let mut s = ls(u128::MAX - 10, 4);
        s.push(NodeKey(u128::MAX - 20));
        s.push(NodeKey(4));
        assert!(s.encompass(&NodeKey(u128::MAX - 1)));
        assert!(s.encompass(&NodeKey(0)));
        assert!(s.encompass(&NodeKey(4)));
        assert!(!s.encompass(&NodeKey(5)));
        assert!(!s.encompass(&NodeKey(u128::MAX - 21)));
    }

    #[test]
    fn empty_set_encompasses_only_pivot() {
        let s = ls(100, 4);
        assert!(s.encompass(&NodeKey(100)));
        assert!(!s.encompass(&NodeKey(101)));
        assert!(s.list_all_nodes().is_empty());
    }

    #[test]
    fn no_key_appears_on_both_sides() {
        let mut s = ls(100, 8);
        s.push_to_right(NodeKey(110));
        s.push_to_left(NodeKey(110));
        let all = s.list_all_nodes();
        assert_eq!(1, all.len());
    }
}
