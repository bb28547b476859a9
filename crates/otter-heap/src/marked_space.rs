//! Size-class segregated cell space.
//!
//! Cells up to [`PRECISE_CUTOFF`] bytes are rounded up to a multiple of
//! [`ATOM_SIZE`]; larger cells, up to [`MAX_CELL_SIZE`], to a multiple of
//! [`IMPRECISE_STEP`]. Each size class owns a list of blocks and a cursor.
//! Allocation pops the class's current free list; when that runs dry the
//! next block at the cursor is swept lazily into a new free list.

use std::ptr::NonNull;

use rustc_hash::FxHashMap;

use crate::block::{BLOCK_SIZE, HeapBlock, block_base};
use crate::cell::CellMeta;
use crate::marked_block::{ATOM_SIZE, BlockState, FreeList, MarkedBlock, SweepMode};

/// Size classes at or below this are spaced one atom apart.
pub const PRECISE_CUTOFF: usize = 256;

/// Spacing of size classes above [`PRECISE_CUTOFF`].
pub const IMPRECISE_STEP: usize = PRECISE_CUTOFF;

/// Largest cell the space will allocate.
pub const MAX_CELL_SIZE: usize = 2048;

const PRECISE_COUNT: usize = PRECISE_CUTOFF / ATOM_SIZE;
const IMPRECISE_COUNT: usize = MAX_CELL_SIZE / IMPRECISE_STEP;

/// Number of size classes.
pub const NUM_SIZE_CLASSES: usize = PRECISE_COUNT + IMPRECISE_COUNT;

/// Index of a size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SizeClassId(usize);

impl SizeClassId {
    /// Position in the size class table.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }

    /// Cell size of this class in bytes
    #[inline]
    pub fn cell_size(self) -> usize {
        if self.0 < PRECISE_COUNT {
            (self.0 + 1) * ATOM_SIZE
        } else {
            (self.0 - PRECISE_COUNT + 1) * IMPRECISE_STEP
        }
    }
}

/// Size class for a request of `bytes`. Zero-byte requests get the smallest class.
///
/// # Panics
/// If `bytes` exceeds [`MAX_CELL_SIZE`].
#[inline]
pub fn size_class_for(bytes: usize) -> SizeClassId {
    assert!(
        bytes <= MAX_CELL_SIZE,
        "cell of {bytes} bytes exceeds the largest size class"
    );
    let bytes = bytes.max(1);
    if bytes <= PRECISE_CUTOFF {
        SizeClassId((bytes - 1) / ATOM_SIZE)
    } else {
        SizeClassId(PRECISE_COUNT + (bytes - 1) / IMPRECISE_STEP)
    }
}

/// Blocks and allocation cursor of one size class.
#[derive(Debug)]
pub struct SizeClass {
    cell_size: usize,
    blocks: Vec<usize>,
    next_block: usize,
    free_list: Option<FreeList>,
}

impl SizeClass {
    fn new(cell_size: usize) -> Self {
        Self {
            cell_size,
            blocks: Vec::new(),
            next_block: 0,
            free_list: None,
        }
    }

    /// Cell size of every block in the class.
    pub fn cell_size(&self) -> usize {
        self.cell_size
    }

    /// Number of blocks in the class.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

/// All marked blocks, grouped by size class.
pub struct MarkedSpace {
    size_classes: Vec<SizeClass>,
    blocks: FxHashMap<usize, MarkedBlock>,
}

impl MarkedSpace {
    /// Space with every size class empty.
    pub fn new() -> Self {
        Self {
            size_classes: (0..NUM_SIZE_CLASSES)
                .map(|index| SizeClass::new(SizeClassId(index).cell_size()))
                .collect(),
            blocks: FxHashMap::default(),
        }
    }

    /// The size class with id `id`.
    pub fn size_class(&self, id: SizeClassId) -> &SizeClass {
        &self.size_classes[id.0]
    }

    /// Pop a cell from the class's current free list.
    #[inline]
    pub fn try_allocate(&mut self, id: SizeClassId, meta: CellMeta) -> Option<NonNull<u8>> {
        let free_list = self.size_classes[id.0].free_list.as_mut()?;
        let index = free_list.pop()?;
        let block = self.blocks.get_mut(&free_list.block())?;
        Some(block.allocate_cell(index, meta))
    }

    /// Retire the exhausted free list and sweep forward from the cursor
    /// until a block yields free cells.
    ///
    /// Returns `None` when every block of the class is full; the caller
    /// then adds a block with [`MarkedSpace::add_block`].
    #[inline(never)]
    pub fn allocate_slow_case(&mut self, id: SizeClassId, meta: CellMeta) -> Option<NonNull<u8>> {
        let class = &mut self.size_classes[id.0];
        if let Some(free_list) = class.free_list.take()
            && let Some(block) = self.blocks.get_mut(&free_list.block())
        {
            if free_list.is_empty() {
                block.did_consume_free_list();
            } else {
                block.canonicalize_cell_liveness(&free_list);
            }
        }

        while class.next_block < class.blocks.len() {
            let address = class.blocks[class.next_block];
            class.next_block += 1;

            let Some(block) = self.blocks.get_mut(&address) else {
                continue;
            };
            let swept = block.sweep(SweepMode::SweepToFreeList);
            if swept.free_list.is_empty() {
                continue;
            }
            class.free_list = Some(swept.free_list);
            return self.try_allocate(id, meta);
        }

        None
    }

    /// Carve a fresh block for `id`. It is the next block the class sweeps.
    pub fn add_block(&mut self, id: SizeClassId, block: HeapBlock) -> usize {
        let class = &mut self.size_classes[id.0];
        let marked = MarkedBlock::new(block, class.cell_size);
        let address = marked.address();
        self.blocks.insert(address, marked);

        let at = class.next_block.min(class.blocks.len());
        class.blocks.insert(at, address);
        address
    }

    /// Fold every checked-out free list back into its block's liveness data.
    pub fn canonicalize_cell_liveness_data(&mut self) {
        for class in &mut self.size_classes {
            let Some(free_list) = class.free_list.take() else {
                continue;
            };
            if let Some(block) = self.blocks.get_mut(&free_list.block()) {
                block.canonicalize_cell_liveness(&free_list);
            }
            // Revisit the block so its remaining free cells are not lost
            class.next_block = class.next_block.saturating_sub(1);
        }
    }

    /// Rewind every size class to its first block.
    pub fn reset_allocators(&mut self) {
        for class in &mut self.size_classes {
            debug_assert!(class.free_list.is_none(), "reset with a checked-out free list");
            class.next_block = 0;
        }
    }

    /// Clear every mark bit for a full collection.
    pub fn clear_marks(&mut self) {
        for block in self.blocks.values_mut() {
            block.clear_marks();
        }
    }

    /// Keep mark bits so old cells survive an eden collection.
    pub fn retain_marks(&mut self) {
        for block in self.blocks.values_mut() {
            block.retain_marks();
        }
    }

    /// Eagerly sweep every block. Returns the bytes reclaimed.
    pub fn sweep(&mut self) -> usize {
        self.blocks
            .values_mut()
            .filter(|block| block.state() != BlockState::New)
            .map(|block| block.sweep(SweepMode::SweepOnly).destroyed * block.cell_size())
            .sum()
    }

    /// Clean every card after a collection.
    pub fn clear_cards(&mut self) {
        for block in self.blocks.values() {
            block.cards().clear_all();
        }
    }

    /// Marked cells in dirty cards, across every block.
    pub fn dirty_cells(&self) -> Vec<usize> {
        let mut cells = Vec::new();
        for block in self.blocks.values() {
            block.for_each_marked_cell_in_dirty_cards(|addr| cells.push(addr));
        }
        cells
    }

    /// Remove every block with no live cells and return its memory.
    ///
    /// Free lists must be canonicalized first.
    pub fn shrink(&mut self) -> Vec<HeapBlock> {
        let empty: Vec<usize> = self
            .blocks
            .iter()
            .filter(|(_, block)| block.is_empty())
            .map(|(&address, _)| address)
            .collect();

        if empty.is_empty() {
            return Vec::new();
        }

        for class in &mut self.size_classes {
            debug_assert!(class.free_list.is_none(), "shrink with a checked-out free list");
            class.blocks.retain(|address| !empty.contains(address));
            class.next_block = 0;
        }

        empty
            .into_iter()
            .filter_map(|address| self.blocks.remove(&address))
            .map(|mut block| {
                block.destroy_all();
                block.into_block()
            })
            .collect()
    }

    /// Destroy every object and release every block.
    pub fn destroy_all(&mut self) -> Vec<HeapBlock> {
        for class in &mut self.size_classes {
            class.free_list = None;
            class.blocks.clear();
            class.next_block = 0;
        }
        self.blocks
            .drain()
            .map(|(_, mut block)| {
                block.destroy_all();
                block.into_block()
            })
            .collect()
    }

    /// Block owning `addr`.
    #[inline]
    pub fn block_for(&self, addr: usize) -> Option<&MarkedBlock> {
        self.blocks.get(&block_base(addr))
    }

    /// Mutable block owning `addr`.
    #[inline]
    pub fn block_for_mut(&mut self, addr: usize) -> Option<&mut MarkedBlock> {
        self.blocks.get_mut(&block_base(addr))
    }

    /// Whether `addr` is the start of a live cell.
    pub fn is_live_cell(&self, addr: usize) -> bool {
        self.block_for(addr)
            .is_some_and(|block| block.is_live_cell(addr))
    }

    /// Metadata of the cell starting at `addr`, if it holds an object.
    pub fn cell_meta(&self, addr: usize) -> Option<CellMeta> {
        let block = self.block_for(addr)?;
        let index = block.cell_index(addr)?;
        block.cell_meta(index)
    }

    /// Visit every live cell. Free lists must be canonicalized first.
    pub fn for_each_live_cell(&self, mut f: impl FnMut(usize, &CellMeta)) {
        for block in self.blocks.values() {
            block.for_each_live_cell(&mut f);
        }
    }

    /// Visit every block.
    pub fn for_each_block(&self, mut f: impl FnMut(&MarkedBlock)) {
        for block in self.blocks.values() {
            f(block);
        }
    }

    /// Number of blocks across all size classes.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Bytes of block memory owned by the space
    pub fn capacity(&self) -> usize {
        self.blocks.len() * BLOCK_SIZE
    }

    /// Live cells across all blocks.
    pub fn live_cell_count(&self) -> usize {
        self.blocks.values().map(MarkedBlock::live_cell_count).sum()
    }

    /// Bytes occupied by live cells
    pub fn size(&self) -> usize {
        self.blocks
            .values()
            .map(|block| block.live_cell_count() * block.cell_size())
            .sum()
    }
}

impl Default for MarkedSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn allocate(space: &mut MarkedSpace, bytes: usize) -> usize {
        let id = size_class_for(bytes);
        if let Some(ptr) = space.try_allocate(id, CellMeta::RAW) {
            return ptr.as_ptr() as usize;
        }
        if let Some(ptr) = space.allocate_slow_case(id, CellMeta::RAW) {
            return ptr.as_ptr() as usize;
        }
        space.add_block(id, HeapBlock::allocate().unwrap());
        space
            .allocate_slow_case(id, CellMeta::RAW)
            .unwrap()
            .as_ptr() as usize
    }

    #[test]
    fn test_size_class_for() {
        assert_eq!(size_class_for(0).cell_size(), 16);
        assert_eq!(size_class_for(1).cell_size(), 16);
        assert_eq!(size_class_for(16).cell_size(), 16);
        assert_eq!(size_class_for(17).cell_size(), 32);
        assert_eq!(size_class_for(256).cell_size(), 256);
        assert_eq!(size_class_for(257).cell_size(), 512);
        assert_eq!(size_class_for(2048).cell_size(), 2048);
    }

    #[test]
    #[should_panic(expected = "exceeds the largest size class")]
    fn test_size_class_too_large() {
        size_class_for(MAX_CELL_SIZE + 1);
    }

    #[test]
    fn test_allocation_stays_in_its_block() {
        let mut space = MarkedSpace::new();
        for bytes in [8, 32, 100, 256, 300, 2048] {
            let addr = allocate(&mut space, bytes);
            let block = space.block_for(addr).unwrap();
            assert_eq!(block.cell_size(), size_class_for(bytes).cell_size());
            assert!(addr + block.cell_size() <= block.address() + BLOCK_SIZE);
        }
        space.destroy_all();
    }

    #[test]
    fn test_no_double_allocation() {
        let mut space = MarkedSpace::new();
        let mut seen = std::collections::HashSet::new();
        // Enough for three blocks of 64-byte cells
        for _ in 0..(3 * BLOCK_SIZE / 64) {
            assert!(seen.insert(allocate(&mut space, 64)));
        }
        assert_eq!(space.block_count(), 3);
        space.destroy_all();
    }

    #[test]
    fn test_canonicalize_keeps_partial_block_usable() {
        let mut space = MarkedSpace::new();
        let first = allocate(&mut space, 32);
        space.canonicalize_cell_liveness_data();
        assert!(space.is_live_cell(first));
        assert_eq!(space.live_cell_count(), 1);

        // Allocation picks the same block back up
        let second = allocate(&mut space, 32);
        assert_eq!(block_base(second), block_base(first));
        assert_ne!(second, first);
        assert_eq!(space.block_count(), 1);
        space.destroy_all();
    }

    #[test]
    fn test_collection_cycle_reclaims_unmarked() {
        let mut space = MarkedSpace::new();
        let cells: Vec<usize> = (0..100).map(|_| allocate(&mut space, 48)).collect();

        space.canonicalize_cell_liveness_data();
        space.clear_marks();
        for &addr in cells.iter().step_by(10) {
            let block = space.block_for_mut(addr).unwrap();
            let index = block.cell_index(addr).unwrap();
            block.test_and_set_marked(index);
        }
        let reclaimed = space.sweep();
        space.reset_allocators();

        assert_eq!(reclaimed, 90 * 48);
        assert_eq!(space.live_cell_count(), 10);
        assert_eq!(space.size(), 10 * 48);

        // Dead cells are reused before any new block is added
        let reused = allocate(&mut space, 48);
        assert!(cells.contains(&reused));
        assert_eq!(space.block_count(), 1);
        space.destroy_all();
    }

    #[test]
    fn test_shrink_releases_empty_blocks() {
        let mut space = MarkedSpace::new();
        allocate(&mut space, 16);
        allocate(&mut space, 512);
        assert_eq!(space.block_count(), 2);

        space.canonicalize_cell_liveness_data();
        space.clear_marks();
        space.sweep();
        space.reset_allocators();

        let released = space.shrink();
        assert_eq!(released.len(), 2);
        assert_eq!(space.block_count(), 0);
        assert_eq!(space.capacity(), 0);
    }

    proptest! {
        #[test]
        fn prop_size_class_fits_request(bytes in 0usize..=MAX_CELL_SIZE) {
            let class = size_class_for(bytes);
            prop_assert!(class.cell_size() >= bytes);
            prop_assert!(class.cell_size().is_multiple_of(ATOM_SIZE));
            let step = if bytes <= PRECISE_CUTOFF { ATOM_SIZE } else { IMPRECISE_STEP };
            prop_assert!(class.cell_size() - bytes.max(1) < step);
        }
    }
}
