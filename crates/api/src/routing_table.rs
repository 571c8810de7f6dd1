//! The prefix-indexed next-hop table of one overlay node.

use crate::{NodeKey, RingConfig};

/// A matrix of `digits x base` candidate next hops, owned by exactly one
/// node. Row `r`, column `c` may hold a node whose key shares an `r`-digit
/// prefix with the owner and has digit `c` at position `r`.
///
/// No cell is ever required to be filled; an empty cell just means "route
/// by leaf set or fallback scan". Cells go stale when the referenced node
/// leaves the ring; staleness is detected by the cleaning service, not
/// prevented here.
///
/// The table also rides inside join-request messages, accumulating one row
/// per prefix level as the request traverses the ring, so it is part of
/// the logical wire contract.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RoutingTable {
    rows: usize,
    cols: usize,
    table: Vec<Vec<Option<NodeKey>>>,
}

impl RoutingTable {
    /// Construct an empty table sized for the given ring.
    pub fn new(config: &RingConfig) -> Self {
        let rows = config.digits();
        let cols = config.base();
        Self {
            rows,
            cols,
            table: vec![vec![None; cols]; rows],
        }
    }

    /// Row count (one row per prefix length).
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Column count (one column per digit value).
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Read a cell. Out-of-range coordinates read as empty.
    pub fn get(&self, row: usize, col: usize) -> Option<NodeKey> {
        self.table.get(row)?.get(col).copied().flatten()
    }

    /// Write (or clear) a cell. Out-of-range coordinates are a no-op, so
    /// callers may push speculative candidates cheaply.
    pub fn set(&mut self, row: usize, col: usize, key: Option<NodeKey>) {
        if row < self.rows && col < self.cols {
            self.table[row][col] = key;
        }
    }

    /// Copy row `row` of `other` into self, overwriting the whole row.
    ///
    /// Used during join to hand one prefix-level of routing knowledge to
    /// the joiner. Rows out of range on either side are a no-op.
    pub fn copy_row_from(&mut self, other: &RoutingTable, row: usize) {
        if row >= self.rows || row >= other.rows {
            return;
        }
        let width = self.cols.min(other.cols);
        self.table[row][..width].copy_from_slice(&other.table[row][..width]);
    }

    /// Iterate all filled cells as `(row, col, key)`.
    pub fn entries(&self) -> impl Iterator<Item = (usize, usize, NodeKey)> + '_ {
        self.table.iter().enumerate().flat_map(|(r, row)| {
            row.iter()
                .enumerate()
                .filter_map(move |(c, k)| k.map(|k| (r, c, k)))
        })
    }

    /// Count of filled cells.
    pub fn len(&self) -> usize {
        self.entries().count()
    }

    /// True if no cell is filled.
    pub fn is_empty(&self) -> bool {
        self.entries().next().is_none()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn small_ring() -> RingConfig {
        RingConfig::new(2, 4).unwrap()
    }

    #[test]
    fn new_table_is_empty() {
        let t = RoutingTable::new(&small_ring());
        assert_eq!(64, t.rows());
        assert_eq!(4, t.cols());
        assert!(t.is_empty());
    }

    #[test]
    fn set_get_round_trip() {
        let mut t = RoutingTable::new(&small_ring());
        let k = NodeKey(42);
        t.set(3, 1, Some(k));
        assert_eq!(Some(k), t.get(3, 1));
        t.set(3, 1, None);
        assert_eq!(None, t.get(3, 1));
    }

    #[test]
    fn out_of_range_is_silent() {
        let mut t = RoutingTable::new(&small_ring());
        t.set(1000, 0, Some(NodeKey(1)));
        t.set(0, 1000, Some(NodeKey(1)));
        assert_eq!(None, t.get(1000, 0));
        assert_eq!(None, t.get(0, 1000));
        assert!(t.is_empty());
    }

    #[test]
    fn copy_row_replaces_whole_row() {
        let c = small_ring();
        let mut a = RoutingTable::new(&c);
        let mut b = RoutingTable::new(&c);
        a.set(2, 0, Some(NodeKey(7)));
        b.set(2, 1, Some(NodeKey(9)));
        a.copy_row_from(&b, 2);
        assert_eq!(None, a.get(2, 0));
        assert_eq!(Some(NodeKey(9)), a.get(2, 1));
        // other rows untouched
        assert_eq!(None, a.get(3, 1));
    }

    #[test]
    fn clone_does_not_alias() {
        let mut a = RoutingTable::new(&small_ring());
        a.set(0, 0, Some(NodeKey(1)));
        let mut b = a.clone();
        b.set(0, 0, Some(NodeKey(2)));
        assert_eq!(Some(NodeKey(1)), a.get(0, 0));
        assert_eq!(Some(NodeKey(2)), b.get(0, 0));
    }

    #[test]
    fn entries_lists_filled_cells() {
        let mut t = RoutingTable::new(&small_ring());
        t.set(0, 3, Some(NodeKey(5)));
        t.set(5, 2, Some(NodeKey(6)));
        let all: Vec<_> = t.entries().collect();
        assert_eq!(vec![(0, 3, NodeKey(5)), (5, 2, NodeKey(6))], all);
        assert_eq!(2, t.len());
    }
}
