//! Copying storage space for variable-sized backing buffers.
//!
//! Cells keep their variable-length data (property vectors, string
//! buffers) in storage allocated here. Allocation bumps a pointer through
//! the current to-space block. Requests larger than
//! [`OVERSIZE_THRESHOLD`] get a dedicated page-rounded block.
//!
//! During a full collection the blocks are evacuated:
//!
//! 1. [`BumpSpace::started_copying`] turns to-space into from-space.
//! 2. Each marking thread copies the live buffers it finds into blocks it
//!    borrowed with [`BumpSpace::borrow_block`] (through a [`CopyCursor`])
//!    and publishes them with [`BumpSpace::done_filling_block`].
//! 3. [`BumpSpace::done_copying`] waits for every borrowed block to come
//!    back, keeps pinned from-space blocks, and returns the rest to the
//!    block pool.
//!
//! Blocks pinned by conservative roots are never evacuated; buffers in
//! them stay where they are for that cycle.

use std::collections::BTreeMap;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::block::{BLOCK_SIZE, HeapBlock, block_base};
use crate::block_pool::BlockPool;
use crate::bloom::TinyBloomFilter;
use crate::error::{HeapError, Result, crash_on_out_of_memory};

/// Requests above this size get their own oversize block.
pub const OVERSIZE_THRESHOLD: usize = BLOCK_SIZE / 2;

/// Alignment of every storage allocation.
pub const STORAGE_ALIGNMENT: usize = 8;

/// Whether a request of `bytes` gets its own oversize block.
#[inline]
pub fn is_oversize(bytes: usize) -> bool {
    bytes > OVERSIZE_THRESHOLD
}

#[inline]
fn storage_size(bytes: usize) -> usize {
    bytes.max(1).next_multiple_of(STORAGE_ALIGNMENT)
}

/// Whether a failed block acquisition may be reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationEffort {
    /// Report an exhausted pool as [`HeapError::OutOfMemory`]
    CanFail,
    /// Abort the process when no block can be obtained
    MustSucceed,
}

/// A block with a bump offset.
#[derive(Debug)]
pub struct BumpBlock {
    block: HeapBlock,
    offset: usize,
    pinned: bool,
}

impl BumpBlock {
    fn new(block: HeapBlock) -> Self {
        Self {
            block,
            offset: 0,
            pinned: false,
        }
    }

    /// Base address of the block.
    #[inline]
    pub fn address(&self) -> usize {
        self.block.address()
    }

    /// Usable bytes in the block.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.block.size()
    }

    /// Bytes handed out so far
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes left to bump.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity() - self.offset
    }

    /// Whether the block stays in place during the next evacuation.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    #[inline]
    fn fits(&self, bytes: usize) -> bool {
        bytes <= self.remaining()
    }

    #[inline]
    fn bump(&mut self, bytes: usize) -> NonNull<u8> {
        debug_assert!(self.fits(bytes));
        // SAFETY: offset + bytes <= capacity, so the result stays inside the block.
        let ptr = unsafe { NonNull::new_unchecked(self.block.base().as_ptr().add(self.offset)) };
        self.offset += bytes;
        ptr
    }

    /// Whether `[ptr, ptr + bytes)` was the most recent bump.
    #[inline]
    fn is_last_allocation(&self, ptr: usize, bytes: usize) -> bool {
        ptr + bytes == self.address() + self.offset
    }

    fn into_block(self) -> HeapBlock {
        self.block
    }
}

struct Spaces {
    to_space: FxHashMap<usize, BumpBlock>,
    from_space: FxHashMap<usize, BumpBlock>,
    /// Ordered by base so interior pointers can be resolved by range
    oversize: BTreeMap<usize, BumpBlock>,
    /// Every block of the space, standard and oversize
    block_set: FxHashSet<usize>,
    to_space_filter: TinyBloomFilter,
    current: Option<usize>,
    in_copying_phase: bool,
    /// From-space address to to-space address of buffers copied this cycle
    forwarding: FxHashMap<usize, usize>,
}

impl Spaces {
    fn add_to_space(&mut self, block: BumpBlock) -> usize {
        let address = block.address();
        self.block_set.insert(address);
        self.to_space_filter.add(address);
        self.to_space.insert(address, block);
        address
    }

    fn block_mut(&mut self, address: usize) -> Option<&mut BumpBlock> {
        if let Some(block) = self.to_space.get_mut(&address) {
            return Some(block);
        }
        if let Some(block) = self.from_space.get_mut(&address) {
            return Some(block);
        }
        self.oversize.get_mut(&address)
    }

    /// Base of the oversize block whose span covers `ptr`.
    ///
    /// Oversize blocks are larger than `BLOCK_SIZE`, so masking a pointer
    /// deep into one lands past its base.
    fn oversize_containing(&self, ptr: usize) -> Option<usize> {
        let (&base, block) = self.oversize.range(..=ptr).next_back()?;
        (ptr < base + block.capacity()).then_some(base)
    }
}

/// What a copying thread should do with a buffer.
enum CopyDecision {
    /// Not in an evacuated block
    Stay,
    /// Already copied this cycle
    Forwarded(usize),
    Copy,
}

#[derive(Debug, Default, Clone, Copy)]
struct MemoryStats {
    /// Capacity of every block owned by the space
    allocated: usize,
    /// Bytes handed out (or kept live) within those blocks
    utilized: usize,
}

/// The copying storage space.
pub struct BumpSpace {
    block_pool: Arc<BlockPool>,
    to_space_lock: Mutex<Spaces>,
    memory_stats_lock: Mutex<MemoryStats>,
    loaned_blocks_lock: Mutex<usize>,
    loaned_blocks_done: Condvar,
}

impl BumpSpace {
    /// Empty space drawing blocks from `block_pool`.
    pub fn new(block_pool: Arc<BlockPool>) -> Self {
        Self {
            block_pool,
            to_space_lock: Mutex::new(Spaces {
                to_space: FxHashMap::default(),
                from_space: FxHashMap::default(),
                oversize: BTreeMap::new(),
                block_set: FxHashSet::default(),
                to_space_filter: TinyBloomFilter::new(),
                current: None,
                in_copying_phase: false,
                forwarding: FxHashMap::default(),
            }),
            memory_stats_lock: Mutex::new(MemoryStats::default()),
            loaned_blocks_lock: Mutex::new(0),
            loaned_blocks_done: Condvar::new(),
        }
    }

    /// Allocate without ever triggering a collection.
    pub fn try_allocate(&self, bytes: usize) -> Result<NonNull<u8>> {
        if is_oversize(bytes) {
            return self.try_allocate_oversize(bytes);
        }
        if let Some(ptr) = self.try_allocate_in_current(bytes) {
            return Ok(ptr);
        }
        self.try_allocate_slow_case(bytes, AllocationEffort::CanFail)
    }

    /// Bump the current block. `None` when there is no current block or it
    /// is too full.
    #[inline]
    pub fn try_allocate_in_current(&self, bytes: usize) -> Option<NonNull<u8>> {
        let bytes = storage_size(bytes);
        let ptr = {
            let mut spaces = self.to_space_lock.lock();
            let current = spaces.current?;
            let block = spaces.to_space.get_mut(&current)?;
            if !block.fits(bytes) {
                return None;
            }
            block.bump(bytes)
        };
        self.memory_stats_lock.lock().utilized += bytes;
        Some(ptr)
    }

    /// Start a fresh current block and allocate from it.
    #[inline(never)]
    pub fn try_allocate_slow_case(
        &self,
        bytes: usize,
        effort: AllocationEffort,
    ) -> Result<NonNull<u8>> {
        let bytes = storage_size(bytes);
        debug_assert!(!is_oversize(bytes));

        let Some(block) = self.block_pool.take_or_allocate() else {
            return match effort {
                AllocationEffort::CanFail => Err(HeapError::OutOfMemory { requested: bytes }),
                AllocationEffort::MustSucceed => crash_on_out_of_memory(bytes),
            };
        };

        let mut block = BumpBlock::new(block);
        let ptr = block.bump(bytes);
        let capacity = block.capacity();
        {
            let mut spaces = self.to_space_lock.lock();
            let address = spaces.add_to_space(block);
            spaces.current = Some(address);
        }

        let mut stats = self.memory_stats_lock.lock();
        stats.allocated += capacity;
        stats.utilized += bytes;
        Ok(ptr)
    }

    /// Allocate a dedicated block for a large request.
    pub fn try_allocate_oversize(&self, bytes: usize) -> Result<NonNull<u8>> {
        let bytes = storage_size(bytes);
        let block =
            HeapBlock::allocate_oversize(bytes).ok_or(HeapError::OutOfMemory { requested: bytes })?;

        let mut block = BumpBlock::new(block);
        let ptr = block.bump(bytes);
        let capacity = block.capacity();
        {
            let mut spaces = self.to_space_lock.lock();
            let address = block.address();
            spaces.block_set.insert(address);
            spaces.to_space_filter.add(address);
            spaces.oversize.insert(address, block);
        }

        let mut stats = self.memory_stats_lock.lock();
        stats.allocated += capacity;
        stats.utilized += bytes;
        Ok(ptr)
    }

    /// Grow (or keep) a storage buffer.
    ///
    /// Shrinking is a no-op. The buffer grows in place when it was the last
    /// bump in the current block; otherwise it is copied into a new
    /// allocation. Oversize buffers that move free their old block at once.
    pub fn try_reallocate(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>> {
        if new_size <= old_size {
            return Ok(ptr);
        }
        if is_oversize(old_size) || is_oversize(new_size) {
            return self.try_reallocate_oversize(ptr, old_size, new_size);
        }

        let old_bytes = storage_size(old_size);
        let new_bytes = storage_size(new_size);
        {
            let mut spaces = self.to_space_lock.lock();
            if let Some(current) = spaces.current
                && let Some(block) = spaces.to_space.get_mut(&current)
                && block.is_last_allocation(ptr.as_ptr() as usize, old_bytes)
                && block.remaining() >= new_bytes - old_bytes
            {
                block.offset += new_bytes - old_bytes;
                drop(spaces);
                self.memory_stats_lock.lock().utilized += new_bytes - old_bytes;
                return Ok(ptr);
            }
        }

        let new_ptr = self.try_allocate(new_size)?;
        // SAFETY: both buffers are at least old_size bytes and never overlap.
        unsafe { ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size) };

        let mut stats = self.memory_stats_lock.lock();
        stats.utilized = stats.utilized.saturating_sub(old_bytes);
        Ok(new_ptr)
    }

    fn try_reallocate_oversize(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>> {
        debug_assert!(is_oversize(new_size));
        let new_ptr = self.try_allocate_oversize(new_size)?;
        // SAFETY: both buffers are at least old_size bytes and never overlap.
        unsafe { ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size) };

        if !is_oversize(old_size) {
            let mut stats = self.memory_stats_lock.lock();
            stats.utilized = stats.utilized.saturating_sub(storage_size(old_size));
            return Ok(new_ptr);
        }

        let old_block = {
            let mut spaces = self.to_space_lock.lock();
            let base = block_base(ptr.as_ptr() as usize);
            let removed = spaces.oversize.remove(&base);
            if removed.is_some() {
                spaces.block_set.remove(&base);
            }
            removed
        };
        if let Some(old_block) = old_block {
            let mut stats = self.memory_stats_lock.lock();
            stats.allocated = stats.allocated.saturating_sub(old_block.capacity());
            stats.utilized = stats.utilized.saturating_sub(old_block.offset());
        }
        Ok(new_ptr)
    }

    /// Base address of the block containing `ptr`, if it belongs to the space.
    ///
    /// Only blocks present when the last copying phase ended, or allocated
    /// since, pass the filter; from-space blocks are invisible while copying.
    /// Any address inside an oversize buffer resolves to its block.
    pub fn contains(&self, ptr: usize) -> Option<usize> {
        let base = block_base(ptr);
        let spaces = self.to_space_lock.lock();
        if !spaces.to_space_filter.rule_out(base) && spaces.block_set.contains(&base) {
            return Some(base);
        }
        spaces
            .oversize_containing(ptr)
            .filter(|&base| !spaces.to_space_filter.rule_out(base))
    }

    /// Keep the block at `base` in place during the next copying phase.
    pub fn pin(&self, base: usize) -> bool {
        let mut spaces = self.to_space_lock.lock();
        match spaces.block_mut(base) {
            Some(block) => {
                block.pinned = true;
                true
            }
            None => false,
        }
    }

    /// Whether the block at `base` is pinned.
    pub fn is_pinned(&self, base: usize) -> bool {
        self.to_space_lock
            .lock()
            .block_mut(base)
            .is_some_and(|block| block.is_pinned())
    }

    /// Drop every pin without copying. Used after cycles that do not evacuate.
    pub fn clear_pins(&self) {
        let mut spaces = self.to_space_lock.lock();
        let spaces = &mut *spaces;
        for block in spaces
            .to_space
            .values_mut()
            .chain(spaces.oversize.values_mut())
        {
            block.pinned = false;
        }
    }

    /// Begin evacuation: to-space becomes from-space.
    pub fn started_copying(&self) {
        debug_assert_eq!(*self.loaned_blocks_lock.lock(), 0);
        {
            let mut spaces = self.to_space_lock.lock();
            debug_assert!(!spaces.in_copying_phase, "copying phase already started");
            debug_assert!(spaces.from_space.is_empty());

            let spaces = &mut *spaces;
            std::mem::swap(&mut spaces.to_space, &mut spaces.from_space);
            spaces.to_space_filter.reset();
            spaces.current = None;
            spaces.in_copying_phase = true;
            spaces.forwarding.clear();
        }
        self.memory_stats_lock.lock().utilized = 0;
    }

    /// Whether an evacuation is between `started_copying` and `done_copying`.
    pub fn is_copying(&self) -> bool {
        self.to_space_lock.lock().in_copying_phase
    }

    /// Decide whether the buffer at `ptr` should be evacuated.
    ///
    /// Oversize buffers are pinned in place; buffers in pinned from-space
    /// blocks stay put; anything not owned by the space is left alone.
    pub fn should_copy(&self, ptr: usize) -> bool {
        matches!(self.copy_decision(ptr), CopyDecision::Copy)
    }

    fn copy_decision(&self, ptr: usize) -> CopyDecision {
        let base = block_base(ptr);
        let mut spaces = self.to_space_lock.lock();
        debug_assert!(spaces.in_copying_phase);
        if let Some(oversize_base) = spaces.oversize_containing(ptr)
            && let Some(block) = spaces.oversize.get_mut(&oversize_base)
        {
            block.pinned = true;
            return CopyDecision::Stay;
        }
        if let Some(&target) = spaces.forwarding.get(&ptr) {
            return CopyDecision::Forwarded(target);
        }
        match spaces.from_space.get(&base) {
            Some(block) if !block.is_pinned() => CopyDecision::Copy,
            _ => CopyDecision::Stay,
        }
    }

    /// Record where `from` was copied. Returns the winning copy when
    /// another thread forwarded the same buffer first.
    fn record_forwarding(&self, from: usize, to: usize) -> usize {
        *self.to_space_lock.lock().forwarding.entry(from).or_insert(to)
    }

    /// Lend a fresh block to a copying thread.
    pub fn borrow_block(&self) -> Result<BumpBlock> {
        let block = self
            .block_pool
            .take_or_allocate()
            .ok_or(HeapError::OutOfMemory {
                requested: BLOCK_SIZE,
            })?;
        *self.loaned_blocks_lock.lock() += 1;
        Ok(BumpBlock::new(block))
    }

    /// Return a borrowed block. Empty blocks go back to the pool, the rest
    /// join to-space.
    pub fn done_filling_block(&self, block: BumpBlock) {
        if block.offset() == 0 {
            self.block_pool.give_back(block.into_block());
        } else {
            let capacity = block.capacity();
            let used = block.offset();
            self.to_space_lock.lock().add_to_space(block);

            let mut stats = self.memory_stats_lock.lock();
            stats.allocated += capacity;
            stats.utilized += used;
        }

        let mut loaned = self.loaned_blocks_lock.lock();
        *loaned -= 1;
        if *loaned == 0 {
            self.loaned_blocks_done.notify_all();
        }
    }

    /// Blocks lent to copying threads and not yet returned.
    pub fn loaned_block_count(&self) -> usize {
        *self.loaned_blocks_lock.lock()
    }

    /// Finish evacuation.
    ///
    /// Blocks until every borrowed block was returned, then keeps pinned
    /// blocks (unpinning them), recycles unpinned from-space blocks and
    /// frees unpinned oversize blocks.
    pub fn done_copying(&self) {
        {
            let mut loaned = self.loaned_blocks_lock.lock();
            while *loaned > 0 {
                self.loaned_blocks_done.wait(&mut loaned);
            }
        }

        let mut recycled = Vec::new();
        let mut freed_oversize = Vec::new();
        let mut kept_bytes = 0;
        let mut released_capacity = 0;
        let needs_fresh_block;
        {
            let mut spaces = self.to_space_lock.lock();
            debug_assert!(spaces.in_copying_phase, "copying phase was never started");

            let from_space = std::mem::take(&mut spaces.from_space);
            for (address, mut block) in from_space {
                if block.is_pinned() {
                    block.pinned = false;
                    kept_bytes += block.offset();
                    spaces.add_to_space(block);
                } else {
                    spaces.block_set.remove(&address);
                    released_capacity += block.capacity();
                    recycled.push(block.into_block());
                }
            }

            let oversize = std::mem::take(&mut spaces.oversize);
            for (address, mut block) in oversize {
                if block.is_pinned() {
                    block.pinned = false;
                    kept_bytes += block.offset();
                    spaces.to_space_filter.add(address);
                    spaces.oversize.insert(address, block);
                } else {
                    spaces.block_set.remove(&address);
                    released_capacity += block.capacity();
                    freed_oversize.push(block);
                }
            }

            spaces.current = spaces
                .to_space
                .values()
                .max_by_key(|block| block.remaining())
                .map(BumpBlock::address);
            spaces.in_copying_phase = false;
            spaces.forwarding.clear();
            needs_fresh_block = spaces.to_space.is_empty();
        }

        for block in recycled {
            self.block_pool.give_back(block);
        }
        drop(freed_oversize);

        {
            let mut stats = self.memory_stats_lock.lock();
            stats.allocated = stats.allocated.saturating_sub(released_capacity);
            stats.utilized += kept_bytes;
        }

        if needs_fresh_block && self.install_fresh_block().is_err() {
            crash_on_out_of_memory(BLOCK_SIZE);
        }
    }

    /// Make an empty block the current to-space block.
    pub fn install_fresh_block(&self) -> Result<()> {
        let block = self
            .block_pool
            .take_or_allocate()
            .ok_or(HeapError::OutOfMemory {
                requested: BLOCK_SIZE,
            })?;
        let block = BumpBlock::new(block);
        let capacity = block.capacity();
        {
            let mut spaces = self.to_space_lock.lock();
            let address = spaces.add_to_space(block);
            spaces.current = Some(address);
        }
        self.memory_stats_lock.lock().allocated += capacity;
        Ok(())
    }

    /// Bytes handed out in live blocks
    pub fn size(&self) -> usize {
        self.memory_stats_lock.lock().utilized
    }

    /// Bytes of block memory owned by the space
    pub fn capacity(&self) -> usize {
        self.memory_stats_lock.lock().allocated
    }

    /// Standard and oversize blocks owned by the space.
    pub fn block_count(&self) -> usize {
        let spaces = self.to_space_lock.lock();
        spaces.to_space.len() + spaces.from_space.len() + spaces.oversize.len()
    }

    /// Number of oversize blocks.
    pub fn oversize_block_count(&self) -> usize {
        self.to_space_lock.lock().oversize.len()
    }

    /// Free every block. Used at heap teardown.
    pub fn free_all(&self) {
        let blocks: Vec<BumpBlock> = {
            let mut spaces = self.to_space_lock.lock();
            spaces.block_set.clear();
            spaces.to_space_filter.reset();
            spaces.current = None;
            spaces.in_copying_phase = false;
            spaces.forwarding.clear();
            let spaces = &mut *spaces;
            let oversize = std::mem::take(&mut spaces.oversize);
            spaces
                .to_space
                .drain()
                .chain(spaces.from_space.drain())
                .chain(oversize)
                .map(|(_, block)| block)
                .collect()
        };
        drop(blocks);
        *self.memory_stats_lock.lock() = MemoryStats::default();
    }
}

/// Per-thread evacuation cursor.
///
/// Copies live buffers into a block borrowed from the space and hands the
/// block back when it fills up, when the cursor finishes, or when it is
/// dropped.
pub struct CopyCursor<'a> {
    space: &'a BumpSpace,
    block: Option<BumpBlock>,
    copied_bytes: usize,
}

impl<'a> CopyCursor<'a> {
    /// Cursor with no block borrowed yet.
    pub fn new(space: &'a BumpSpace) -> Self {
        Self {
            space,
            block: None,
            copied_bytes: 0,
        }
    }

    /// Evacuate `bytes` at `ptr` if its block is being evacuated.
    ///
    /// Returns the new location, or `None` when the buffer stays in place.
    /// A buffer reported by several owners is copied once; later owners
    /// get the forwarded address.
    pub fn copy(&mut self, ptr: *mut u8, bytes: usize) -> Option<NonNull<u8>> {
        if ptr.is_null() || bytes == 0 {
            return None;
        }
        match self.space.copy_decision(ptr as usize) {
            CopyDecision::Stay => return None,
            CopyDecision::Forwarded(target) => return NonNull::new(target as *mut u8),
            CopyDecision::Copy => {}
        }
        debug_assert!(!is_oversize(bytes), "oversize buffer found in a standard block");

        let target = self.allocate(bytes);
        // SAFETY: the source is a live buffer of `bytes` bytes in from-space and
        // the target was just bumped out of a borrowed block.
        unsafe { ptr::copy_nonoverlapping(ptr, target.as_ptr(), bytes) };
        self.copied_bytes += bytes;

        let winner = self.space.record_forwarding(ptr as usize, target.as_ptr() as usize);
        NonNull::new(winner as *mut u8)
    }

    fn allocate(&mut self, bytes: usize) -> NonNull<u8> {
        let bytes = storage_size(bytes);
        if let Some(block) = &mut self.block
            && block.fits(bytes)
        {
            return block.bump(bytes);
        }

        if let Some(full) = self.block.take() {
            self.space.done_filling_block(full);
        }
        let mut block = match self.space.borrow_block() {
            Ok(block) => block,
            Err(_) => crash_on_out_of_memory(BLOCK_SIZE),
        };
        let ptr = block.bump(bytes);
        self.block = Some(block);
        ptr
    }

    /// Bytes copied so far.
    pub fn copied_bytes(&self) -> usize {
        self.copied_bytes
    }

    /// Return the current block. Returns the number of bytes copied.
    pub fn finish(mut self) -> usize {
        if let Some(block) = self.block.take() {
            self.space.done_filling_block(block);
        }
        self.copied_bytes
    }
}

impl Drop for CopyCursor<'_> {
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            self.space.done_filling_block(block);
        }
    }
}
