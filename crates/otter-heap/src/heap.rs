//! GC Heap management
//!
//! [`Heap`] ties the spaces together: cell allocation in the
//! [`AllocationSpace`], storage allocation in the [`BumpSpace`], the root
//! sets (protect counts, handle stack, root providers, conservative spans),
//! the write barrier and the collection cycle itself.
//!
//! A collection runs with the object space locked:
//!
//! 1. Canonicalize free lists so cell liveness is readable.
//! 2. Gather conservative roots (pinning storage blocks they point into).
//! 3. Clear marks (full) or keep them (eden); full cycles start copying.
//! 4. Mark from every root and, for eden, the marked cells of dirty cards.
//! 5. Finish copying, clear cards, optionally sweep, reset allocators.

use std::collections::BTreeMap;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::allocation_space::AllocationSpace;
use crate::block::BLOCK_SIZE;
use crate::block_pool::{BlockPool, spawn_block_freeing_thread};
use crate::bump_space::{AllocationEffort, BumpSpace, CopyCursor, is_oversize};
use crate::cell::{CellMeta, CellRef, Trace};
use crate::config::HeapConfig;
use crate::conservative_roots::ConservativeRoots;
use crate::error::{HeapError, Result, crash_on_out_of_memory};
use crate::handle_stack::HandleStack;
use crate::marked_block::ATOM_SIZE;
use crate::marked_space::{SizeClassId, size_class_for};
use crate::visitor::SlotVisitor;

/// What the heap is doing right now
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationInProgress {
    /// Idle
    NoOperation = 0,
    /// A mutator is in the cell allocation slow path
    Allocation = 1,
    /// A collection (or teardown) is running
    Collection = 2,
}

impl From<u8> for OperationInProgress {
    fn from(value: u8) -> Self {
        match value {
            1 => OperationInProgress::Allocation,
            2 => OperationInProgress::Collection,
            _ => OperationInProgress::NoOperation,
        }
    }
}

/// Whether a collection sweeps eagerly or leaves it to allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepToggle {
    /// Sweep every block before returning
    DoSweep,
    /// Leave sweeping to the allocator
    DoNotSweep,
}

/// Which cells a collection may reclaim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionScope {
    /// Clear all marks and evacuate storage
    Full,
    /// Keep survivors' marks; only cells allocated since the last cycle
    /// are candidates for reclamation
    Eden,
}

/// Source of roots outside the heap.
///
/// Both callbacks run while the heap's object space is locked; they must
/// not allocate from the heap.
pub trait RootProvider: Send + Sync {
    /// Hand spans of words to scan conservatively, e.g. a native stack.
    fn conservative_spans(&self, _scan: &mut dyn FnMut(&[usize])) {}

    /// Report precise roots to the visitor.
    fn visit_roots(&self, _visitor: &mut SlotVisitor<'_>) {}
}

/// Reference-counted protection of individual cells.
#[derive(Debug, Default)]
struct ProtectCountSet {
    counts: FxHashMap<usize, usize>,
}

impl ProtectCountSet {
    fn add(&mut self, addr: usize) {
        *self.counts.entry(addr).or_insert(0) += 1;
    }

    /// Returns true when the count dropped to zero.
    fn remove(&mut self, addr: usize) -> bool {
        let Some(count) = self.counts.get_mut(&addr) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            self.counts.remove(&addr);
            return true;
        }
        false
    }

    fn addresses(&self) -> Vec<usize> {
        self.counts.keys().copied().collect()
    }

    fn len(&self) -> usize {
        self.counts.len()
    }

    fn clear(&mut self) {
        self.counts.clear();
    }
}

/// Collection statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    /// Total number of collections performed
    pub collection_count: usize,
    /// How many of those were eden collections
    pub eden_collection_count: usize,
    /// Bytes of cells reclaimed by the last eager sweep
    pub last_reclaimed: usize,
    /// Live cells after the last collection
    pub last_live_objects: usize,
    /// Live cell and storage bytes after the last collection
    pub last_live_bytes: usize,
    /// Cells traced by the last collection
    pub last_visited_cells: usize,
    /// Storage bytes evacuated by the last collection
    pub last_copied_bytes: usize,
    /// Conservative roots found by the last collection
    pub last_conservative_roots: usize,
    /// Total pause time accumulated across all collections
    pub total_pause_time: Duration,
    /// Pause time of the last collection
    pub last_pause_time: Duration,
}

/// A garbage-collected heap.
pub struct Heap {
    config: HeapConfig,
    object_space: Mutex<AllocationSpace>,
    storage_space: BumpSpace,
    block_pool: Arc<BlockPool>,
    block_freeing_thread: Mutex<Option<JoinHandle<()>>>,
    operation: AtomicU8,
    collection_lock: Mutex<()>,
    protected_values: Mutex<ProtectCountSet>,
    handle_stack: HandleStack,
    root_providers: RwLock<Vec<Arc<dyn RootProvider>>>,
    bytes_allocated: CachePadded<AtomicUsize>,
    bytes_allocated_limit: AtomicUsize,
    defer_depth: AtomicUsize,
    write_barrier_count: CachePadded<AtomicU64>,
    stats: Mutex<HeapStats>,
    destroyed: AtomicBool,
}

impl Heap {
    /// Create a heap and start its block freeing thread.
    pub fn new(config: HeapConfig) -> Result<Self> {
        config.validate()?;

        let block_pool = Arc::new(BlockPool::new());
        let storage_space = BumpSpace::new(Arc::clone(&block_pool));
        storage_space.install_fresh_block()?;
        let thread =
            spawn_block_freeing_thread(Arc::clone(&block_pool), config.block_freeing_interval)?;

        tracing::debug!(
            target: "otter::heap",
            min_bytes_per_cycle = config.min_bytes_per_cycle,
            generational_barrier = config.generational_barrier,
            "heap created"
        );

        Ok(Self {
            object_space: Mutex::new(AllocationSpace::new()),
            storage_space,
            block_pool,
            block_freeing_thread: Mutex::new(Some(thread)),
            operation: AtomicU8::new(OperationInProgress::NoOperation as u8),
            collection_lock: Mutex::new(()),
            protected_values: Mutex::new(ProtectCountSet::default()),
            handle_stack: HandleStack::new(),
            root_providers: RwLock::new(Vec::new()),
            bytes_allocated: CachePadded::new(AtomicUsize::new(0)),
            bytes_allocated_limit: AtomicUsize::new(config.min_bytes_per_cycle),
            defer_depth: AtomicUsize::new(0),
            write_barrier_count: CachePadded::new(AtomicU64::new(0)),
            stats: Mutex::new(HeapStats::default()),
            destroyed: AtomicBool::new(false),
            config,
        })
    }

    /// Configuration the heap was created with.
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Cell allocation
    // ------------------------------------------------------------------

    /// Allocate a zeroed, untyped cell of at least `bytes` bytes.
    ///
    /// Aborts the process if memory is exhausted even after a collection.
    ///
    /// # Panics
    /// If `bytes` exceeds [`MAX_CELL_SIZE`](crate::MAX_CELL_SIZE) or the
    /// heap was destroyed.
    pub fn allocate(&self, bytes: usize) -> NonNull<u8> {
        let size_class = size_class_for(bytes);
        let cell_size = size_class.cell_size();
        self.allocate_with(size_class, CellMeta::RAW, |ptr| {
            // SAFETY: the cell spans cell_size writable bytes.
            unsafe { ptr::write_bytes(ptr.as_ptr(), 0, cell_size) }
        })
    }

    /// Move `value` into a new cell.
    ///
    /// The cell is traced with `T::trace` and dropped in place when it is
    /// found dead.
    ///
    /// May run a collection before `value` is moved into the heap. Cells
    /// referenced only from `value` are not roots during that collection;
    /// root them (protect, handles or a conservative span) across the call.
    pub fn allocate_cell<T: Trace + Send + 'static>(&self, value: T) -> CellRef<T> {
        assert!(
            std::mem::align_of::<T>() <= ATOM_SIZE,
            "cell types must not need more than {ATOM_SIZE}-byte alignment"
        );
        let size_class = size_class_for(std::mem::size_of::<T>());
        let ptr = self.allocate_with(size_class, CellMeta::of::<T>(), move |ptr| {
            // SAFETY: the cell is at least size_of::<T>() bytes and
            // ATOM_SIZE aligned.
            unsafe { ptr.cast::<T>().as_ptr().write(value) }
        });
        CellRef::from_raw(ptr.cast())
    }

    /// Allocate a cell and initialize it before any other thread can
    /// observe it.
    fn allocate_with(
        &self,
        size_class: SizeClassId,
        meta: CellMeta,
        init: impl FnOnce(NonNull<u8>),
    ) -> NonNull<u8> {
        assert!(
            !self.destroyed.load(Ordering::Acquire),
            "allocation on a destroyed heap"
        );

        {
            let mut space = self.object_space.lock();
            if let Some(ptr) = space.try_allocate(size_class, meta) {
                init(ptr);
                drop(space);
                self.did_allocate(size_class.cell_size());
                return ptr;
            }
        }
        self.allocate_slow_case(size_class, meta, init)
    }

    #[inline(never)]
    fn allocate_slow_case(
        &self,
        size_class: SizeClassId,
        meta: CellMeta,
        init: impl FnOnce(NonNull<u8>),
    ) -> NonNull<u8> {
        if self.should_collect() {
            self.collect(SweepToggle::DoNotSweep);
        }

        let cell_size = size_class.cell_size();
        let mut retried = false;
        let mut space = self.object_space.lock();
        loop {
            let entered = self.enter_operation(OperationInProgress::Allocation);
            let allocated = space.allocate_slow_case(size_class, meta);
            if entered {
                self.exit_operation(OperationInProgress::Allocation);
            }

            if let Some(ptr) = allocated {
                init(ptr);
                drop(space);
                self.did_allocate(cell_size);
                return ptr;
            }

            match self.block_pool.take_or_allocate() {
                Some(block) => space.add_block(size_class, block),
                None if !retried => {
                    retried = true;
                    drop(space);
                    tracing::warn!(
                        target: "otter::heap",
                        cell_size,
                        "block allocation failed; collecting before retrying"
                    );
                    self.collect(SweepToggle::DoSweep);
                    space = self.object_space.lock();
                }
                None => crash_on_out_of_memory(cell_size),
            }
        }
    }

    // ------------------------------------------------------------------
    // Storage allocation
    // ------------------------------------------------------------------

    /// Allocate a storage buffer of `bytes` bytes.
    ///
    /// May run a collection when the allocation budget is spent; buffers
    /// reachable only from the caller's locals must be rooted (or pinned
    /// through a conservative span) across this call.
    pub fn try_allocate_storage(&self, bytes: usize) -> Result<NonNull<u8>> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(HeapError::Destroyed);
        }

        let ptr = if is_oversize(bytes) {
            self.allocate_oversize_storage(bytes)?
        } else if let Some(ptr) = self.storage_space.try_allocate_in_current(bytes) {
            ptr
        } else {
            self.allocate_storage_slow_case(bytes)?
        };
        self.did_allocate(bytes);
        Ok(ptr)
    }

    #[inline(never)]
    fn allocate_storage_slow_case(&self, bytes: usize) -> Result<NonNull<u8>> {
        if self.should_collect() {
            self.collect(SweepToggle::DoNotSweep);
            if let Some(ptr) = self.storage_space.try_allocate_in_current(bytes) {
                return Ok(ptr);
            }
            return self
                .storage_space
                .try_allocate_slow_case(bytes, AllocationEffort::MustSucceed);
        }

        match self
            .storage_space
            .try_allocate_slow_case(bytes, AllocationEffort::CanFail)
        {
            Err(HeapError::OutOfMemory { .. }) => {
                self.collect(SweepToggle::DoSweep);
                self.storage_space
                    .try_allocate_slow_case(bytes, AllocationEffort::CanFail)
            }
            result => result,
        }
    }

    fn allocate_oversize_storage(&self, bytes: usize) -> Result<NonNull<u8>> {
        match self.storage_space.try_allocate_oversize(bytes) {
            Err(HeapError::OutOfMemory { .. }) => {
                self.collect(SweepToggle::DoSweep);
                self.storage_space.try_allocate_oversize(bytes)
            }
            result => result,
        }
    }

    /// Grow a storage buffer. Never collects.
    pub fn try_reallocate_storage(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(HeapError::Destroyed);
        }
        let moved = self.storage_space.try_reallocate(ptr, old_size, new_size)?;
        if new_size > old_size {
            self.did_allocate(new_size - old_size);
        }
        Ok(moved)
    }

    #[inline]
    fn did_allocate(&self, bytes: usize) {
        self.bytes_allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    fn should_collect(&self) -> bool {
        self.config.collect_on_allocation
            && self.defer_depth.load(Ordering::Relaxed) == 0
            && self.operation_in_progress() == OperationInProgress::NoOperation
            && self.bytes_allocated.load(Ordering::Relaxed)
                >= self.bytes_allocated_limit.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Roots and barriers
    // ------------------------------------------------------------------

    /// Record that `owner` now references `value`.
    ///
    /// With the generational barrier enabled, a store into an already
    /// marked cell dirties the owner's card so the next eden collection
    /// rescans it.
    pub fn write_barrier(&self, owner: usize, value: usize) {
        self.write_barrier_count.fetch_add(1, Ordering::Relaxed);
        if !self.config.generational_barrier || value == 0 {
            return;
        }

        let space = self.object_space.lock();
        if let Some(block) = space.marked_space().block_for(owner)
            && block.is_marked(owner)
        {
            block.cards().mark_card_for(owner - block.address());
        }
    }

    /// Typed form of [`Heap::write_barrier`].
    pub fn write_barrier_cell<T, U>(&self, owner: CellRef<T>, value: CellRef<U>) {
        self.write_barrier(owner.address(), value.address());
    }

    /// Keep `addr` alive until a matching [`Heap::unprotect`].
    pub fn protect(&self, addr: usize) {
        if addr == 0 {
            return;
        }
        self.protected_values.lock().add(addr);
    }

    /// Drop one protection. Returns true when the cell is no longer protected.
    pub fn unprotect(&self, addr: usize) -> bool {
        if addr == 0 {
            return false;
        }
        self.protected_values.lock().remove(addr)
    }

    /// Typed form of [`Heap::protect`].
    pub fn protect_cell<T>(&self, cell: CellRef<T>) {
        self.protect(cell.address());
    }

    /// Typed form of [`Heap::unprotect`].
    pub fn unprotect_cell<T>(&self, cell: CellRef<T>) -> bool {
        self.unprotect(cell.address())
    }

    /// Precise roots pushed by host code
    pub fn handles(&self) -> &HandleStack {
        &self.handle_stack
    }

    /// Register a source of roots for every future collection.
    pub fn add_root_provider(&self, provider: Arc<dyn RootProvider>) {
        self.root_providers.write().push(provider);
    }

    /// Unregister a provider. Returns whether it was registered.
    pub fn remove_root_provider(&self, provider: &Arc<dyn RootProvider>) -> bool {
        let mut providers = self.root_providers.write();
        let before = providers.len();
        providers.retain(|registered| !Arc::ptr_eq(registered, provider));
        providers.len() != before
    }

    /// Whether `addr` is the start of a live cell of this heap.
    pub fn is_heap_cell(&self, addr: usize) -> bool {
        self.object_space.lock().is_heap_cell(addr)
    }

    // ------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------

    /// Current heap operation.
    pub fn operation_in_progress(&self) -> OperationInProgress {
        OperationInProgress::from(self.operation.load(Ordering::Acquire))
    }

    /// Whether an allocation slow path or a collection is running.
    pub fn is_busy(&self) -> bool {
        self.operation_in_progress() != OperationInProgress::NoOperation
    }

    fn enter_operation(&self, operation: OperationInProgress) -> bool {
        self.operation
            .compare_exchange(
                OperationInProgress::NoOperation as u8,
                operation as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn exit_operation(&self, operation: OperationInProgress) {
        let _ = self.operation.compare_exchange(
            operation as u8,
            OperationInProgress::NoOperation as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Suppress allocation-triggered collections until the guard drops.
    pub fn defer_collection(&self) -> DeferCollection<'_> {
        self.defer_depth.fetch_add(1, Ordering::Relaxed);
        DeferCollection { heap: self }
    }

    /// Full collection followed by an eager sweep.
    pub fn collect_all_garbage(&self) {
        self.collect_with_scope(CollectionScope::Full, SweepToggle::DoSweep);
    }

    /// Full collection.
    pub fn collect(&self, sweep: SweepToggle) {
        self.collect_with_scope(CollectionScope::Full, sweep);
    }

    /// Eden collection when the generational barrier is enabled, full otherwise.
    pub fn collect_eden(&self) {
        let scope = if self.config.generational_barrier {
            CollectionScope::Eden
        } else {
            CollectionScope::Full
        };
        self.collect_with_scope(scope, SweepToggle::DoSweep);
    }

    fn collect_with_scope(&self, scope: CollectionScope, sweep: SweepToggle) {
        // Re-entrant requests (from trace or drop functions) and requests
        // racing another thread's collection are dropped.
        if self.destroyed.load(Ordering::Acquire)
            || self.operation_in_progress() == OperationInProgress::Collection
        {
            return;
        }
        let _collecting = self.collection_lock.lock();
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }

        let start = Instant::now();
        let providers: Vec<Arc<dyn RootProvider>> = self.root_providers.read().clone();
        let mut space = self.object_space.lock();
        self.operation
            .store(OperationInProgress::Collection as u8, Ordering::Release);

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "otter::heap",
            ?scope,
            allocated_bytes = self.bytes_allocated.load(Ordering::Relaxed),
            protected = self.protected_values.lock().len(),
            handles = self.handle_stack.len(),
            "GC cycle starting"
        );

        space.canonicalize_cell_liveness_data();

        // Liveness is read before marks are cleared
        let conservative = {
            let mut roots = ConservativeRoots::new(&space, &self.storage_space);
            for provider in &providers {
                provider.conservative_spans(&mut |words: &[usize]| roots.add(words));
            }
            roots.into_roots()
        };

        let copying = scope == CollectionScope::Full;
        match scope {
            CollectionScope::Full => space.marked_space_mut().clear_marks(),
            CollectionScope::Eden => space.marked_space_mut().retain_marks(),
        }
        if copying {
            self.storage_space.started_copying();
        }

        let dirty_cells = match scope {
            CollectionScope::Eden => space.marked_space().dirty_cells(),
            CollectionScope::Full => Vec::new(),
        };
        let protected = self.protected_values.lock().addresses();
        let handles = self.handle_stack.snapshot();

        let visit_stats = {
            let copier = copying.then(|| CopyCursor::new(&self.storage_space));
            let mut visitor = SlotVisitor::new(space.marked_space_mut(), copier);
            for &root in conservative.iter().chain(&protected).chain(&handles) {
                visitor.append(root);
            }
            for provider in &providers {
                provider.visit_roots(&mut visitor);
            }
            for cell in dirty_cells {
                visitor.rescan(cell);
            }
            visitor.drain();
            visitor.finish()
        };

        if copying {
            self.storage_space.done_copying();
        } else {
            self.storage_space.clear_pins();
        }

        let marked_space = space.marked_space_mut();
        marked_space.clear_cards();
        let reclaimed = match sweep {
            SweepToggle::DoSweep => marked_space.sweep(),
            SweepToggle::DoNotSweep => 0,
        };
        marked_space.reset_allocators();
        let live_objects = marked_space.live_cell_count();
        let live_bytes = marked_space.size() + self.storage_space.size();
        drop(space);

        self.bytes_allocated.store(0, Ordering::Relaxed);
        self.bytes_allocated_limit.store(
            live_bytes.max(self.config.min_bytes_per_cycle),
            Ordering::Relaxed,
        );

        let elapsed = start.elapsed();
        {
            let mut stats = self.stats.lock();
            stats.collection_count += 1;
            if scope == CollectionScope::Eden {
                stats.eden_collection_count += 1;
            }
            stats.last_reclaimed = reclaimed;
            stats.last_live_objects = live_objects;
            stats.last_live_bytes = live_bytes;
            stats.last_visited_cells = visit_stats.visited_cells;
            stats.last_copied_bytes = visit_stats.copied_bytes;
            stats.last_conservative_roots = conservative.len();
            stats.total_pause_time += elapsed;
            stats.last_pause_time = elapsed;
        }

        self.operation
            .store(OperationInProgress::NoOperation as u8, Ordering::Release);

        #[cfg(feature = "gc_logging")]
        tracing::info!(
            target: "otter::heap",
            collection = self.stats.lock().collection_count,
            ?scope,
            reclaimed_bytes = reclaimed,
            copied_bytes = visit_stats.copied_bytes,
            conservative_roots = conservative.len(),
            pause_us = elapsed.as_micros() as u64,
            live_bytes,
            live_objects,
            "GC cycle complete"
        );
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    /// Bytes of live cells plus storage in use
    pub fn size(&self) -> usize {
        let cells = {
            let mut space = self.object_space.lock();
            space.canonicalize_cell_liveness_data();
            space.marked_space().size()
        };
        cells + self.storage_space.size()
    }

    /// Bytes of block memory held by the heap: both spaces plus the free
    /// block pool.
    ///
    /// Blocks a collection releases stay pooled, so only [`Heap::shrink`],
    /// [`Heap::release_free_blocks`] or the block freeing thread lower it.
    pub fn capacity(&self) -> usize {
        self.object_space.lock().marked_space().capacity()
            + self.storage_space.capacity()
            + self.block_pool.len() * BLOCK_SIZE
    }

    /// Bytes of storage in use
    pub fn storage_size(&self) -> usize {
        self.storage_space.size()
    }

    /// Number of live cells
    pub fn object_count(&self) -> usize {
        let mut space = self.object_space.lock();
        space.canonicalize_cell_liveness_data();
        space.marked_space().live_cell_count()
    }

    /// Number of distinct protected cells
    pub fn protected_object_count(&self) -> usize {
        self.protected_values.lock().len()
    }

    /// Live cells grouped by type name
    pub fn object_type_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        self.object_space.lock().for_each_cell(|_, meta| {
            *counts.entry(meta.type_name).or_insert(0) += 1;
        });
        counts
    }

    /// Protected cells grouped by type name
    pub fn protected_object_type_counts(&self) -> BTreeMap<&'static str, usize> {
        let protected = self.protected_values.lock().addresses();
        let space = self.object_space.lock();
        let mut counts = BTreeMap::new();
        for addr in protected {
            if let Some(meta) = space.marked_space().cell_meta(addr) {
                *counts.entry(meta.type_name).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Statistics of the collections so far.
    pub fn stats(&self) -> HeapStats {
        *self.stats.lock()
    }

    /// Bytes allocated since the last collection
    pub fn bytes_allocated_this_cycle(&self) -> usize {
        self.bytes_allocated.load(Ordering::Relaxed)
    }

    /// Allocation budget of the current cycle
    pub fn bytes_allocated_limit(&self) -> usize {
        self.bytes_allocated_limit.load(Ordering::Relaxed)
    }

    /// Number of write barrier calls.
    pub fn write_barrier_count(&self) -> u64 {
        self.write_barrier_count.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Memory release and teardown
    // ------------------------------------------------------------------

    /// Return blocks with no live cells, and every pooled block, to the OS.
    ///
    /// Collection alone never lowers [`Heap::capacity`]; this does.
    pub fn shrink(&self) {
        let _collecting = self.collection_lock.lock();
        let released = {
            let mut space = self.object_space.lock();
            self.operation
                .store(OperationInProgress::Collection as u8, Ordering::Release);
            let released = space.shrink();
            self.operation
                .store(OperationInProgress::NoOperation as u8, Ordering::Release);
            released
        };
        let released_blocks = released.len();
        drop(released);
        let pooled_blocks = self.block_pool.release_all();

        tracing::debug!(
            target: "otter::heap",
            released_blocks,
            pooled_blocks,
            "heap shrunk"
        );
    }

    /// Free every pooled block now instead of waiting for the freeing thread.
    pub fn release_free_blocks(&self) -> usize {
        self.block_pool.release_all()
    }

    /// Destroy every object, free every block and stop the freeing thread.
    ///
    /// Calling it twice returns [`HeapError::Destroyed`].
    pub fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Err(HeapError::Destroyed);
        }

        let _collecting = self.collection_lock.lock();
        let blocks = {
            let mut space = self.object_space.lock();
            self.operation
                .store(OperationInProgress::Collection as u8, Ordering::Release);
            space.destroy_all()
        };
        drop(blocks);
        self.storage_space.free_all();

        self.protected_values.lock().clear();
        self.handle_stack.truncate(0);
        self.root_providers.write().clear();

        self.block_pool.request_quit();
        let joined = self.block_freeing_thread.lock().take().map(JoinHandle::join);
        self.block_pool.release_all();
        self.operation
            .store(OperationInProgress::NoOperation as u8, Ordering::Release);

        tracing::debug!(target: "otter::heap", "heap destroyed");

        match joined {
            Some(Err(_)) => Err(HeapError::BlockFreeingThreadPanicked),
            _ => Ok(()),
        }
    }

    /// Whether [`Heap::destroy`] ran.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        tracing::warn!(target: "otter::heap", "heap dropped without destroy(); tearing down");
        if let Err(error) = self.destroy() {
            tracing::error!(target: "otter::heap", %error, "heap teardown failed");
        }
    }
}

/// Guard returned by [`Heap::defer_collection`].
pub struct DeferCollection<'a> {
    heap: &'a Heap,
}

impl Drop for DeferCollection<'_> {
    fn drop(&mut self) {
        self.heap.defer_depth.fetch_sub(1, Ordering::Relaxed);
    }
}
