//! Compact per-block bit set.

use alloc::vec::Vec;

/// One bit per block of the managed region. Used for the adapter's erased
/// tracking and for the reachable set during maintenance sweeps.
pub(crate) struct BlockSet {
    words: Vec<u64>,
    len: usize,
}

impl BlockSet {
    pub fn new(len: usize) -> Self {
        BlockSet {
            words: alloc::vec![0; len.div_ceil(64)],
            len,
        }
    }

    pub fn insert(&mut self, block: u32) {
        let block = block as usize;
        if block < self.len {
            self.words[block / 64] |= 1 << (block % 64);
        }
    }

    pub fn remove(&mut self, block: u32) {
        let block = block as usize;
        if block < self.len {
            self.words[block / 64] &= !(1 << (block % 64));
        }
    }

    pub fn contains(&self, block: u32) -> bool {
        let block = block as usize;
        block < self.len && self.words[block / 64] & (1 << (block % 64)) != 0
    }

    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_remove_contains() {
        let mut set = BlockSet::new(130);
        assert!(!set.contains(0));
        set.insert(0);
        set.insert(64);
        set.insert(129);
        assert!(set.contains(0));
        assert!(set.contains(64));
        assert!(set.contains(129));
        assert_eq!(set.count(), 3);
        set.remove(64);
        assert!(!set.contains(64));
        set.clear();
        assert_eq!(set.count(), 0);
    }

    #[test]
    fn out_of_range_blocks_are_ignored() {
        let mut set = BlockSet::new(8);
        set.insert(8);
        assert!(!set.contains(8));
        assert_eq!(set.count(), 0);
    }
}
