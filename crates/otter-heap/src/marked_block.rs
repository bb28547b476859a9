//! Fixed-size cell blocks.
//!
//! A `MarkedBlock` carves one 64KB [`HeapBlock`] into equally sized cells.
//! Everything the collector needs to know about the cells is stored out of
//! line, next to the block rather than inside it:
//!
//! ```text
//! HeapBlock (64KB, 64KB aligned)        MarkedBlock metadata
//! ┌──────────────────────────┐          ┌────────────────────────────┐
//! │ Cell 0: [u8; cell_size]  │ <──────  │ state: BlockState          │
//! │ Cell 1: [u8; cell_size]  │          │ marks: one bit per cell    │
//! │ ...                      │          │ cell_meta: Option<CellMeta>│
//! │ Cell K: [u8; cell_size]  │          │ cards: CardSet             │
//! └──────────────────────────┘          └────────────────────────────┘
//! ```
//!
//! How a cell's liveness is read depends on the block's state:
//!
//! | State | Live cells |
//! |---|---|
//! | `New` | none |
//! | `FreeListed` | cells not on the checked-out free list |
//! | `Allocated` | all |
//! | `Marked` | cells whose mark bit is set |
//! | `Zapped` | cells whose metadata is present |

use std::ptr::NonNull;

use crate::block::{BLOCK_SIZE, HeapBlock};
use crate::card_set::CardSet;
use crate::cell::CellMeta;

/// Allocation granule. Every cell size is a multiple of this.
pub const ATOM_SIZE: usize = 16;

/// Liveness source of a block's cells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Freshly carved, nothing allocated yet
    New,
    /// A free list built from this block is checked out by its size class
    FreeListed,
    /// Every cell was handed out since the last sweep
    Allocated,
    /// Mark bits are authoritative
    Marked,
    /// Swept; dead cells are zapped
    Zapped,
}

/// What a sweep produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepMode {
    /// Destroy dead objects only
    SweepOnly,
    /// Destroy dead objects and hand the dead cells out as a free list
    SweepToFreeList,
}

/// Dead cells of one block, popped lowest address first.
#[derive(Debug, Default)]
pub struct FreeList {
    block: usize,
    cells: Vec<u16>,
}

impl FreeList {
    /// Base address of the block the cells belong to
    pub fn block(&self) -> usize {
        self.block
    }

    /// Number of free cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether no cell is free.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Option<usize> {
        self.cells.pop().map(usize::from)
    }
}

/// Result of sweeping one block
#[derive(Debug)]
pub struct Swept {
    /// Dead cells, empty unless sweeping to a free list
    pub free_list: FreeList,
    /// Objects whose destructors ran during this sweep
    pub destroyed: usize,
}

/// One bit per cell, stored as u64 words.
#[derive(Debug)]
struct Bitmap {
    words: Vec<u64>,
}

impl Bitmap {
    fn new(bits: usize) -> Self {
        Self {
            words: vec![0; bits.div_ceil(64)],
        }
    }

    #[inline]
    fn get(&self, index: usize) -> bool {
        self.words[index / 64] & (1u64 << (index % 64)) != 0
    }

    /// Set a bit, returning its previous value.
    #[inline]
    fn test_and_set(&mut self, index: usize) -> bool {
        let word = &mut self.words[index / 64];
        let bit = 1u64 << (index % 64);
        let was_set = *word & bit != 0;
        *word |= bit;
        was_set
    }

    #[inline]
    fn clear(&mut self, index: usize) {
        self.words[index / 64] &= !(1u64 << (index % 64));
    }

    fn clear_all(&mut self) {
        self.words.fill(0);
    }

    fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// A 64KB block of equally sized cells.
pub struct MarkedBlock {
    block: HeapBlock,
    cell_size: usize,
    cells: usize,
    state: BlockState,
    marks: Bitmap,
    cell_meta: Vec<Option<CellMeta>>,
    cards: CardSet,
}

impl MarkedBlock {
    /// Carve `block` into cells of `cell_size` bytes.
    pub fn new(block: HeapBlock, cell_size: usize) -> Self {
        assert!(
            cell_size >= ATOM_SIZE && cell_size.is_multiple_of(ATOM_SIZE),
            "cell size must be a non-zero multiple of {ATOM_SIZE}"
        );
        assert!(cell_size <= BLOCK_SIZE, "cell size too large for block");
        assert_eq!(block.size(), BLOCK_SIZE, "marked blocks must be standard blocks");

        let cells = BLOCK_SIZE / cell_size;
        debug_assert!(cells <= usize::from(u16::MAX) + 1);

        Self {
            block,
            cell_size,
            cells,
            state: BlockState::New,
            marks: Bitmap::new(cells),
            cell_meta: vec![None; cells],
            cards: CardSet::new(),
        }
    }

    /// Base address of the underlying block.
    #[inline]
    pub fn address(&self) -> usize {
        self.block.address()
    }

    /// Cell size in bytes.
    #[inline]
    pub fn cell_size(&self) -> usize {
        self.cell_size
    }

    /// Number of cells the block holds.
    #[inline]
    pub fn cells_per_block(&self) -> usize {
        self.cells
    }

    /// Current state.
    #[inline]
    pub fn state(&self) -> BlockState {
        self.state
    }

    /// Card set dirtied by the write barrier.
    #[inline]
    pub fn cards(&self) -> &CardSet {
        &self.cards
    }

    /// Address of cell `index`.
    #[inline]
    pub fn cell_address(&self, index: usize) -> usize {
        self.address() + index * self.cell_size
    }

    /// Index of the cell starting exactly at `addr`.
    ///
    /// Pointers into the middle of a cell, or past the last whole cell,
    /// yield `None`.
    #[inline]
    pub fn cell_index(&self, addr: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.address())?;
        if !offset.is_multiple_of(self.cell_size) {
            return None;
        }
        let index = offset / self.cell_size;
        (index < self.cells).then_some(index)
    }

    /// Whether cell `index` holds no object.
    #[inline]
    pub fn is_zapped(&self, index: usize) -> bool {
        self.cell_meta[index].is_none()
    }

    /// Metadata of the object in cell `index`, if any.
    pub fn cell_meta(&self, index: usize) -> Option<CellMeta> {
        self.cell_meta[index]
    }

    /// Liveness of a cell under the current block state.
    pub fn is_live(&self, index: usize) -> bool {
        match self.state {
            BlockState::New => false,
            BlockState::Allocated => true,
            BlockState::Marked => self.marks.get(index),
            BlockState::FreeListed | BlockState::Zapped => !self.is_zapped(index),
        }
    }

    /// Whether `addr` is the start of a live cell in this block.
    pub fn is_live_cell(&self, addr: usize) -> bool {
        self.cell_index(addr).is_some_and(|index| self.is_live(index))
    }

    /// Mark bit of cell `index`.
    #[inline]
    pub fn is_marked_index(&self, index: usize) -> bool {
        self.marks.get(index)
    }

    /// Mark bit of the cell starting at `addr`.
    pub fn is_marked(&self, addr: usize) -> bool {
        self.cell_index(addr)
            .is_some_and(|index| self.marks.get(index))
    }

    /// Set a cell's mark bit, returning whether it was already set.
    #[inline]
    pub fn test_and_set_marked(&mut self, index: usize) -> bool {
        self.marks.test_and_set(index)
    }

    /// Number of marked cells.
    pub fn mark_count(&self) -> usize {
        self.marks.count_ones()
    }

    /// Hand out cell `index` from a checked-out free list.
    pub(crate) fn allocate_cell(&mut self, index: usize, meta: CellMeta) -> NonNull<u8> {
        debug_assert_eq!(self.state, BlockState::FreeListed);
        debug_assert!(self.is_zapped(index), "free list handed out a live cell");

        self.cell_meta[index] = Some(meta);
        self.marks.clear(index);

        // SAFETY: index < cells, so the cell lies inside the block.
        unsafe { NonNull::new_unchecked(self.block.base().as_ptr().add(index * self.cell_size)) }
    }

    /// Destroy every dead cell that still holds an object.
    ///
    /// With `SweepToFreeList` all dead cells are returned as a free list and
    /// the block becomes `FreeListed` (or `Allocated` when nothing is free).
    /// With `SweepOnly` the block becomes `Zapped`.
    pub fn sweep(&mut self, mode: SweepMode) -> Swept {
        debug_assert_ne!(
            self.state,
            BlockState::FreeListed,
            "sweeping a block whose free list is checked out"
        );

        let mut dead = Vec::new();
        let mut destroyed = 0;

        for index in 0..self.cells {
            if self.is_live(index) {
                continue;
            }
            if let Some(meta) = self.cell_meta[index].take() {
                if let Some(drop_fn) = meta.drop {
                    // SAFETY: the cell holds an initialized object that is
                    // unreachable; its metadata was just taken so it is
                    // destroyed exactly once.
                    unsafe { drop_fn(self.cell_address(index) as *mut u8) }
                }
                destroyed += 1;
            }
            if mode == SweepMode::SweepToFreeList {
                dead.push(index as u16);
            }
        }

        // Popping from the back yields the lowest address first
        dead.reverse();

        self.state = match mode {
            SweepMode::SweepToFreeList if dead.is_empty() => BlockState::Allocated,
            SweepMode::SweepToFreeList => BlockState::FreeListed,
            SweepMode::SweepOnly => BlockState::Zapped,
        };

        Swept {
            free_list: FreeList {
                block: self.address(),
                cells: dead,
            },
            destroyed,
        }
    }

    /// The size class ran this block's free list dry.
    pub(crate) fn did_consume_free_list(&mut self) {
        debug_assert_eq!(self.state, BlockState::FreeListed);
        self.state = BlockState::Allocated;
    }

    /// Fold a partially consumed free list back into the liveness data.
    ///
    /// Cells still on the list are zapped already, so the block only needs
    /// to switch to reading liveness from its metadata.
    pub(crate) fn canonicalize_cell_liveness(&mut self, free_list: &FreeList) {
        debug_assert_eq!(self.state, BlockState::FreeListed);
        debug_assert_eq!(free_list.block(), self.address());
        self.state = if free_list.is_empty() {
            BlockState::Allocated
        } else {
            BlockState::Zapped
        };
    }

    /// Start a full marking cycle: nothing is marked.
    pub fn clear_marks(&mut self) {
        debug_assert_ne!(self.state, BlockState::FreeListed);
        self.marks.clear_all();
        if self.state != BlockState::New {
            self.state = BlockState::Marked;
        }
    }

    /// Start an eden marking cycle: survivors of the previous cycle stay
    /// marked, everything allocated since is unmarked.
    pub fn retain_marks(&mut self) {
        debug_assert_ne!(self.state, BlockState::FreeListed);
        // Cells allocated since the last cycle had their bit cleared by
        // allocate_cell, so reading marks turns them into candidates.
        if matches!(self.state, BlockState::Allocated | BlockState::Zapped) {
            self.state = BlockState::Marked;
        }
    }

    /// Number of live cells under the current state.
    pub fn live_cell_count(&self) -> usize {
        match self.state {
            BlockState::New => 0,
            BlockState::Allocated => self.cells,
            BlockState::Marked => self.mark_count(),
            BlockState::FreeListed | BlockState::Zapped => {
                self.cell_meta.iter().filter(|meta| meta.is_some()).count()
            }
        }
    }

    /// True when no cell is live.
    pub fn is_empty(&self) -> bool {
        self.live_cell_count() == 0
    }

    /// Visit every live cell with its metadata.
    ///
    /// Cells that are live but hold no metadata (possible only in `Marked`
    /// blocks for raw cells marked without an object) are skipped.
    pub fn for_each_live_cell(&self, mut f: impl FnMut(usize, &CellMeta)) {
        if self.state == BlockState::New {
            return;
        }
        for index in 0..self.cells {
            if !self.is_live(index) {
                continue;
            }
            if let Some(meta) = &self.cell_meta[index] {
                f(self.cell_address(index), meta);
            }
        }
    }

    /// Live, marked cells whose start lies in a dirty card.
    pub fn for_each_marked_cell_in_dirty_cards(&self, mut f: impl FnMut(usize)) {
        for card in self.cards.dirty_cards() {
            let (start, end) = CardSet::card_range(card);
            let first = start.div_ceil(self.cell_size);
            let last = end.div_ceil(self.cell_size).min(self.cells);
            for index in first..last {
                if self.marks.get(index) && !self.is_zapped(index) {
                    f(self.cell_address(index));
                }
            }
        }
    }

    /// Run the destructor of every cell still holding an object.
    ///
    /// Used when a block is released or the heap is torn down. Returns the
    /// number of objects destroyed.
    pub fn destroy_all(&mut self) -> usize {
        let mut destroyed = 0;
        for index in 0..self.cells {
            if let Some(meta) = self.cell_meta[index].take() {
                if let Some(drop_fn) = meta.drop {
                    // SAFETY: the cell holds an initialized object and its
                    // metadata was just taken.
                    unsafe { drop_fn(self.cell_address(index) as *mut u8) }
                }
                destroyed += 1;
            }
        }
        self.marks.clear_all();
        self.state = BlockState::New;
        destroyed
    }

    /// Give the memory back. All objects must have been destroyed.
    pub fn into_block(self) -> HeapBlock {
        debug_assert!(self.cell_meta.iter().all(Option::is_none));
        self.block
    }
}

impl std::fmt::Debug for MarkedBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkedBlock")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("cell_size", &self.cell_size)
            .field("state", &self.state)
            .finish()
    }
}
