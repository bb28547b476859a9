//! Set of block base addresses with a bloom-filter pre-check.

use rustc_hash::FxHashSet;

use crate::bloom::TinyBloomFilter;

/// Membership set for block addresses.
///
/// `contains` consults the one-word filter before hashing, so most
/// non-block words seen during conservative scanning are rejected with a
/// single AND.
#[derive(Debug, Default)]
pub struct BlockSet {
    filter: TinyBloomFilter,
    set: FxHashSet<usize>,
}

impl BlockSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a block base and fold it into the filter.
    pub fn add(&mut self, block: usize) {
        self.filter.add(block);
        self.set.insert(block);
    }

    /// Remove a block. The filter is rebuilt from the remaining members.
    pub fn remove(&mut self, block: usize) -> bool {
        let removed = self.set.remove(&block);
        if removed {
            self.filter.reset();
            for &member in &self.set {
                self.filter.add(member);
            }
        }
        removed
    }

    /// Exact membership, checked after the filter.
    #[inline]
    pub fn contains(&self, block: usize) -> bool {
        !self.filter.rule_out(block) && self.set.contains(&block)
    }

    /// Filter over every block in the set.
    #[inline]
    pub fn filter(&self) -> &TinyBloomFilter {
        &self.filter
    }

    /// Block bases in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.set.iter().copied()
    }

    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Forget every block and reset the filter.
    pub fn clear(&mut self) {
        self.filter.reset();
        self.set.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BLOCK_SIZE;

    #[test]
    fn test_add_contains_remove() {
        let mut set = BlockSet::new();
        let a = 3 * BLOCK_SIZE;
        let b = 7 * BLOCK_SIZE;
        set.add(a);
        set.add(b);
        assert!(set.contains(a));
        assert!(set.contains(b));
        assert!(!set.contains(5 * BLOCK_SIZE));
        assert_eq!(set.len(), 2);

        assert!(set.remove(a));
        assert!(!set.remove(a));
        assert!(!set.contains(a));
        assert!(set.contains(b));
    }

    #[test]
    fn test_remove_rebuilds_filter() {
        let mut set = BlockSet::new();
        set.add(0x10_0000);
        set.add(0x20_0000);
        set.remove(0x10_0000);
        assert!(set.filter().rule_out(0x10_0000));
    }

    #[test]
    fn test_clear() {
        let mut set = BlockSet::new();
        set.add(BLOCK_SIZE);
        set.clear();
        assert!(set.is_empty());
        assert!(!set.contains(BLOCK_SIZE));
    }
}
