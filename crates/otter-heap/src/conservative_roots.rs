//! Conservative root discovery.
//!
//! Hosts hand the heap raw words (stack spans, register dumps) whose
//! meaning is unknown. A word is kept as a root when it is the start of a
//! live cell; a word that points anywhere into a storage block pins that
//! block so the buffer it may refer to is not moved.

use smallvec::SmallVec;

use crate::allocation_space::AllocationSpace;
use crate::block::block_base;
use crate::bump_space::BumpSpace;

/// Roots found without spilling to the heap.
pub const INLINE_CAPACITY: usize = 128;

/// Candidate cells gathered from conservatively scanned words.
pub struct ConservativeRoots<'a> {
    space: &'a AllocationSpace,
    storage: &'a BumpSpace,
    roots: SmallVec<[usize; INLINE_CAPACITY]>,
    pinned_blocks: usize,
}

impl<'a> ConservativeRoots<'a> {
    /// Collect candidates against the cells of `space` and the blocks of `storage`.
    pub fn new(space: &'a AllocationSpace, storage: &'a BumpSpace) -> Self {
        Self {
            space,
            storage,
            roots: SmallVec::new(),
            pinned_blocks: 0,
        }
    }

    /// Scan a span of words.
    pub fn add(&mut self, words: &[usize]) {
        for &word in words {
            self.add_candidate(word);
        }
    }

    /// Scan the words in `[begin, end)`.
    ///
    /// `begin` is rounded up and `end` down to word alignment.
    ///
    /// # Safety
    /// The whole range must be readable for the duration of the call.
    pub unsafe fn add_range(&mut self, begin: *const u8, end: *const u8) {
        let word = std::mem::size_of::<usize>();
        let start = (begin as usize).next_multiple_of(word);
        let stop = (end as usize) & !(word - 1);
        if stop <= start {
            return;
        }
        // SAFETY: the caller guarantees the range is readable; start and
        // stop are word aligned and within it.
        let words =
            unsafe { std::slice::from_raw_parts(start as *const usize, (stop - start) / word) };
        self.add(words);
    }

    fn add_candidate(&mut self, word: usize) {
        if word == 0 {
            return;
        }

        if let Some(block) = self.storage.contains(word)
            && self.storage.pin(block)
        {
            self.pinned_blocks += 1;
        }

        let blocks = self.space.blocks();
        let base = block_base(word);
        if blocks.filter().rule_out(base) || !blocks.contains(base) {
            return;
        }
        if !self.space.marked_space().is_live_cell(word) {
            return;
        }
        self.roots.push(word);
    }

    /// Cells found so far. May contain duplicates.
    pub fn roots(&self) -> &[usize] {
        &self.roots
    }

    /// Number of live cells found.
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// Whether no candidate resolved to a live cell.
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Number of storage pins requested while scanning
    pub fn pinned_count(&self) -> usize {
        self.pinned_blocks
    }

    /// The live cells found, for marking.
    pub fn into_roots(self) -> SmallVec<[usize; INLINE_CAPACITY]> {
        self.roots
    }
}
