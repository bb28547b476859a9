//! Object space: the marked space plus the set of its block addresses.

use std::ptr::NonNull;

use crate::block::{HeapBlock, block_base};
use crate::block_set::BlockSet;
use crate::cell::CellMeta;
use crate::marked_block::MarkedBlock;
use crate::marked_space::{MarkedSpace, SizeClassId};

/// Cell allocation front end.
///
/// Owns the [`MarkedSpace`] and a [`BlockSet`] of every marked block so
/// arbitrary words can be tested for "is this a heap cell" cheaply.
#[derive(Default)]
pub struct AllocationSpace {
    marked_space: MarkedSpace,
    blocks: BlockSet,
}

impl AllocationSpace {
    /// Empty space with no blocks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inline fast path: pop the size class's free list.
    #[inline]
    pub fn try_allocate(&mut self, size_class: SizeClassId, meta: CellMeta) -> Option<NonNull<u8>> {
        self.marked_space.try_allocate(size_class, meta)
    }

    /// Lazily sweep the size class's remaining blocks for a free cell.
    #[inline(never)]
    pub fn allocate_slow_case(
        &mut self,
        size_class: SizeClassId,
        meta: CellMeta,
    ) -> Option<NonNull<u8>> {
        self.marked_space.allocate_slow_case(size_class, meta)
    }

    /// Add a fresh block to a size class.
    pub fn add_block(&mut self, size_class: SizeClassId, block: HeapBlock) {
        let address = self.marked_space.add_block(size_class, block);
        self.blocks.add(address);
    }

    /// Blocks owned by the marked space, with their bloom filter.
    #[inline]
    pub fn blocks(&self) -> &BlockSet {
        &self.blocks
    }

    /// The underlying size-class allocator.
    #[inline]
    pub fn marked_space(&self) -> &MarkedSpace {
        &self.marked_space
    }

    /// Mutable access for marking and sweeping.
    #[inline]
    pub fn marked_space_mut(&mut self) -> &mut MarkedSpace {
        &mut self.marked_space
    }

    /// Whether `addr` is the start of a live cell of this space.
    pub fn is_heap_cell(&self, addr: usize) -> bool {
        self.blocks.contains(block_base(addr)) && self.marked_space.is_live_cell(addr)
    }

    /// Fold checked-out free lists back into block liveness.
    pub fn canonicalize_cell_liveness_data(&mut self) {
        self.marked_space.canonicalize_cell_liveness_data();
    }

    /// Visit every live cell after canonicalizing free lists.
    pub fn for_each_cell(&mut self, f: impl FnMut(usize, &CellMeta)) {
        self.canonicalize_cell_liveness_data();
        self.marked_space.for_each_live_cell(f);
    }

    /// Visit every block after canonicalizing free lists.
    pub fn for_each_block(&mut self, f: impl FnMut(&MarkedBlock)) {
        self.canonicalize_cell_liveness_data();
        self.marked_space.for_each_block(f);
    }

    /// Release every block with no live cells.
    pub fn shrink(&mut self) -> Vec<HeapBlock> {
        self.canonicalize_cell_liveness_data();
        let released = self.marked_space.shrink();
        for block in &released {
            self.blocks.remove(block.address());
        }
        released
    }

    /// Destroy every object and release every block.
    pub fn destroy_all(&mut self) -> Vec<HeapBlock> {
        self.blocks.clear();
        self.marked_space.destroy_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marked_space::size_class_for;

    fn allocate(space: &mut AllocationSpace, bytes: usize) -> usize {
        let id = size_class_for(bytes);
        let ptr = space
            .try_allocate(id, CellMeta::RAW)
            .or_else(|| space.allocate_slow_case(id, CellMeta::RAW))
            .unwrap_or_else(|| {
                space.add_block(id, HeapBlock::allocate().unwrap());
                space.allocate_slow_case(id, CellMeta::RAW).unwrap()
            });
        ptr.as_ptr() as usize
    }

    #[test]
    fn test_is_heap_cell() {
        let mut space = AllocationSpace::new();
        let addr = allocate(&mut space, 40);
        space.canonicalize_cell_liveness_data();

        assert!(space.is_heap_cell(addr));
        // Interior pointer
        assert!(!space.is_heap_cell(addr + 8));
        // Unallocated cell in the same block
        assert!(!space.is_heap_cell(addr + 48));
        // Not a heap block at all
        let local = 0u64;
        assert!(!space.is_heap_cell(&local as *const u64 as usize));
        space.destroy_all();
    }

    #[test]
    fn test_blocks_tracked() {
        let mut space = AllocationSpace::new();
        let a = allocate(&mut space, 16);
        let b = allocate(&mut space, 1024);
        assert_eq!(space.blocks().len(), 2);
        assert!(space.blocks().contains(block_base(a)));
        assert!(space.blocks().contains(block_base(b)));
        space.destroy_all();
        assert!(space.blocks().is_empty());
    }

    #[test]
    fn test_for_each_cell_counts_allocations() {
        let mut space = AllocationSpace::new();
        for _ in 0..25 {
            allocate(&mut space, 64);
        }
        let mut count = 0;
        space.for_each_cell(|_, meta| {
            assert_eq!(meta.type_name, "raw");
            count += 1;
        });
        assert_eq!(count, 25);
        space.destroy_all();
    }
}
