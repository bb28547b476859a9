//! Heap behavior tests
//!
//! These tests drive whole collection cycles through the public `Heap`
//! surface: rooting, sweeping, storage evacuation, pinning and teardown.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use otter_heap::{
    BLOCK_SIZE, CellRef, Heap, HeapConfig, HeapError, OVERSIZE_THRESHOLD, RootProvider,
    SlotVisitor, Trace,
};
use parking_lot::Mutex;

/// Heap that only collects when asked and keeps its pooled blocks
fn manual_heap() -> Heap {
    Heap::new(HeapConfig {
        collect_on_allocation: false,
        block_freeing_interval: Duration::from_secs(3600),
        ..HeapConfig::default()
    })
    .unwrap()
}

/// Root provider handing out a list of words to scan conservatively
#[derive(Default)]
struct ConservativeWords {
    words: Mutex<Vec<usize>>,
}

impl RootProvider for ConservativeWords {
    fn conservative_spans(&self, scan: &mut dyn FnMut(&[usize])) {
        scan(self.words.lock().as_slice());
    }
}

/// A cell owning a storage buffer
struct Buffer {
    data: *mut u8,
    len: usize,
}

// SAFETY: the buffer is only touched by the thread holding the cell.
unsafe impl Send for Buffer {}

impl Trace for Buffer {
    fn trace(&mut self, visitor: &mut SlotVisitor<'_>) {
        visitor.visit_storage(&mut self.data, self.len);
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn allocate_filled(heap: &Heap, contents: &[u8]) -> CellRef<Buffer> {
    let len = contents.len();
    let data = heap.try_allocate_storage(len).unwrap();
    // SAFETY: the storage spans len bytes.
    unsafe { std::ptr::copy_nonoverlapping(contents.as_ptr(), data.as_ptr(), len) };
    heap.allocate_cell(Buffer {
        data: data.as_ptr(),
        len,
    })
}

fn allocate_buffer(heap: &Heap, len: usize) -> CellRef<Buffer> {
    let buffer = allocate_filled(heap, &pattern(len));
    heap.protect_cell(buffer);
    buffer
}

fn buffer_contents(buffer: CellRef<Buffer>) -> Vec<u8> {
    // SAFETY: the cell is protected and its buffer is live.
    unsafe {
        let buffer = buffer.get();
        std::slice::from_raw_parts(buffer.data, buffer.len).to_vec()
    }
}

fn buffer_address(buffer: CellRef<Buffer>) -> usize {
    // SAFETY: the cell is protected.
    unsafe { buffer.get().data as usize }
}

struct Node {
    next: Option<CellRef<Node>>,
    value: u64,
}

impl Trace for Node {
    fn trace(&mut self, visitor: &mut SlotVisitor<'_>) {
        self.next.trace(visitor);
    }
}

#[test]
fn test_conservative_roots_keep_cells_alive() {
    let heap = manual_heap();
    let roots = Arc::new(ConservativeWords::default());
    heap.add_root_provider(roots.clone());

    let cells: Vec<usize> = (0..10_000)
        .map(|_| heap.allocate(32).as_ptr() as usize)
        .collect();
    roots.words.lock().extend_from_slice(&cells[..1_000]);
    assert_eq!(heap.object_count(), 10_000);

    let capacity = heap.capacity();
    heap.collect_all_garbage();

    assert_eq!(heap.object_count(), 1_000);
    assert_eq!(heap.stats().last_conservative_roots, 1_000);
    assert!(cells[..1_000].iter().all(|&cell| heap.is_heap_cell(cell)));
    assert!(!heap.is_heap_cell(cells[5_000]));
    assert_eq!(heap.capacity(), capacity);

    heap.shrink();
    assert!(heap.capacity() < capacity);
    assert_eq!(heap.object_count(), 1_000);

    heap.destroy().unwrap();
}

#[test]
fn test_copying_preserves_storage() {
    let heap = manual_heap();
    let buffer = allocate_buffer(&heap, 1000);
    let garbage = heap.try_allocate_storage(5000).unwrap();
    assert_eq!(heap.storage_size(), 6000);

    let before = buffer_address(buffer);
    heap.collect_all_garbage();

    assert_ne!(buffer_address(buffer), before);
    assert_ne!(buffer_address(buffer), garbage.as_ptr() as usize);
    assert_eq!(buffer_contents(buffer), pattern(1000));
    assert_eq!(heap.storage_size(), 1000);
    assert_eq!(heap.stats().last_copied_bytes, 1000);

    heap.destroy().unwrap();
}

#[test]
fn test_collection_keeps_released_blocks_in_capacity() {
    let heap = manual_heap();
    for _ in 0..8 {
        heap.try_allocate_storage(30 * 1024).unwrap();
    }
    let capacity = heap.capacity();
    assert_eq!(capacity, 4 * BLOCK_SIZE);

    heap.collect_all_garbage();
    assert_eq!(heap.storage_size(), 0);
    assert_eq!(heap.capacity(), capacity);

    assert_eq!(heap.release_free_blocks(), 3);
    assert_eq!(heap.capacity(), BLOCK_SIZE);

    heap.destroy().unwrap();
}

#[test]
fn test_shared_storage_is_copied_once() {
    let heap = manual_heap();
    let first = allocate_buffer(&heap, 64);
    let second = heap.allocate_cell(Buffer {
        // SAFETY: first is protected.
        data: unsafe { first.get().data },
        len: 64,
    });
    heap.protect_cell(second);

    heap.collect_all_garbage();

    assert_eq!(buffer_address(first), buffer_address(second));
    assert_eq!(heap.storage_size(), 64);
    assert_eq!(heap.stats().last_copied_bytes, 64);

    // Writes through one owner are seen by the other
    // SAFETY: both cells are protected and share a 64-byte buffer.
    unsafe { *first.get().data = 0xEE };
    assert_eq!(buffer_contents(second)[0], 0xEE);

    heap.destroy().unwrap();
}

#[test]
fn test_conservative_word_deep_in_oversize_storage() {
    let heap = manual_heap();
    let roots = Arc::new(ConservativeWords::default());
    heap.add_root_provider(roots.clone());

    let len = 200 * 1024;
    let ptr = heap.try_allocate_storage(len).unwrap();
    roots.words.lock().push(ptr.as_ptr() as usize + 100_000);
    assert_eq!(heap.storage_size(), len);

    heap.collect_all_garbage();
    assert_eq!(heap.storage_size(), len);

    roots.words.lock().clear();
    heap.collect_all_garbage();
    assert_eq!(heap.storage_size(), 0);

    heap.destroy().unwrap();
}

fn seeded(seed: usize, len: usize) -> Vec<u8> {
    (0..len).map(|k| ((seed * 31 + k) % 251) as u8).collect()
}

#[test]
fn test_copying_preserves_reachable_graph() {
    let heap = manual_heap();
    let roots = Arc::new(ConservativeWords::default());
    heap.add_root_provider(roots.clone());

    let count = 500;
    let lens: Vec<usize> = (0..count).map(|i| 200 + (i % 5) * 40).collect();
    let cells: Vec<CellRef<Buffer>> = (0..count)
        .map(|i| allocate_filled(&heap, &seeded(i, lens[i])))
        .collect();
    let addresses: Vec<usize> = cells.iter().map(|&cell| buffer_address(cell)).collect();

    // Every third cell is protected, every sixth (offset 4) is found conservatively
    let reachable: Vec<usize> = (0..count).filter(|i| i % 3 == 0 || i % 6 == 4).collect();
    for &i in &reachable {
        if i % 3 == 0 {
            heap.protect_cell(cells[i]);
        } else {
            roots.words.lock().push(cells[i].address());
        }
    }

    // A word into the middle of an unreachable buffer pins its block
    let pinned_owner = 251;
    assert!(!reachable.contains(&pinned_owner));
    let pinned_base = addresses[pinned_owner] & !(BLOCK_SIZE - 1);
    roots.words.lock().push(addresses[pinned_owner] + 4);

    let in_pinned = |i: usize| addresses[i] & !(BLOCK_SIZE - 1) == pinned_base;
    let pinned_bytes = (0..count)
        .filter(|&i| in_pinned(i))
        .map(|i| addresses[i] + lens[i] - pinned_base)
        .max()
        .unwrap();
    let copied: usize = reachable
        .iter()
        .filter(|&&i| !in_pinned(i))
        .map(|&i| lens[i])
        .sum();
    assert!(copied > 0);

    heap.collect_all_garbage();

    assert_eq!(heap.object_count(), reachable.len());
    for &i in &reachable {
        assert_eq!(buffer_contents(cells[i]), seeded(i, lens[i]));
        if in_pinned(i) {
            assert_eq!(buffer_address(cells[i]), addresses[i]);
        } else {
            assert_ne!(buffer_address(cells[i]), addresses[i]);
        }
    }
    assert_eq!(heap.stats().last_copied_bytes, copied);
    assert_eq!(heap.storage_size(), copied + pinned_bytes);

    heap.destroy().unwrap();
}

#[test]
fn test_conservative_word_pins_storage_block() {
    let heap = manual_heap();
    let roots = Arc::new(ConservativeWords::default());
    heap.add_root_provider(roots.clone());

    let buffer = allocate_buffer(&heap, 512);
    let address = buffer_address(buffer);
    roots.words.lock().push(address + 8);

    heap.collect_all_garbage();
    assert_eq!(buffer_address(buffer), address);
    assert_eq!(buffer_contents(buffer), pattern(512));

    roots.words.lock().clear();
    heap.collect_all_garbage();
    assert_ne!(buffer_address(buffer), address);
    assert_eq!(buffer_contents(buffer), pattern(512));

    heap.destroy().unwrap();
}

#[test]
fn test_oversize_storage_survives_in_place() {
    let heap = manual_heap();
    let len = BLOCK_SIZE;
    assert!(len > OVERSIZE_THRESHOLD);

    let buffer = allocate_buffer(&heap, len);
    let address = buffer_address(buffer);

    heap.collect_all_garbage();
    assert_eq!(buffer_address(buffer), address);
    assert_eq!(buffer_contents(buffer), pattern(len));
    assert_eq!(heap.storage_size(), len);

    assert!(heap.unprotect_cell(buffer));
    heap.collect_all_garbage();
    assert_eq!(heap.storage_size(), 0);
    assert_eq!(heap.object_count(), 0);

    heap.destroy().unwrap();
}

#[test]
fn test_reallocate_storage_keeps_contents() {
    let heap = manual_heap();
    let ptr = heap.try_allocate_storage(64).unwrap();
    // SAFETY: the storage spans 64 bytes.
    unsafe { std::ptr::copy_nonoverlapping(pattern(64).as_ptr(), ptr.as_ptr(), 64) };

    let grown = heap.try_reallocate_storage(ptr, 64, 256).unwrap();
    assert_eq!(grown, ptr);
    assert_eq!(heap.storage_size(), 256);

    let _other = heap.try_allocate_storage(16).unwrap();
    let moved = heap.try_reallocate_storage(grown, 256, 1024).unwrap();
    assert_ne!(moved, grown);
    // SAFETY: the moved buffer spans 1024 bytes.
    let prefix = unsafe { std::slice::from_raw_parts(moved.as_ptr(), 64) };
    assert_eq!(prefix, pattern(64).as_slice());

    heap.destroy().unwrap();
}

#[test]
fn test_protect_counting() {
    let heap = manual_heap();
    let cell = heap.allocate_cell(Node {
        next: None,
        value: 7,
    });

    heap.protect_cell(cell);
    heap.protect_cell(cell);
    assert_eq!(heap.protected_object_count(), 1);

    heap.collect_all_garbage();
    assert!(!heap.unprotect_cell(cell));
    heap.collect_all_garbage();
    assert_eq!(heap.object_count(), 1);
    // SAFETY: still protected once.
    assert_eq!(unsafe { cell.get().value }, 7);

    assert!(heap.unprotect_cell(cell));
    assert_eq!(heap.protected_object_count(), 0);
    heap.collect_all_garbage();
    assert_eq!(heap.object_count(), 0);

    heap.destroy().unwrap();
}

#[test]
fn test_cells_reachable_through_references() {
    let heap = manual_heap();
    let tail = heap.allocate_cell(Node {
        next: None,
        value: 3,
    });
    let middle = heap.allocate_cell(Node {
        next: Some(tail),
        value: 2,
    });
    let head = heap.allocate_cell(Node {
        next: Some(middle),
        value: 1,
    });
    heap.allocate_cell(Node {
        next: Some(tail),
        value: 99,
    });
    heap.protect_cell(head);

    heap.collect_all_garbage();
    assert_eq!(heap.object_count(), 3);
    assert_eq!(heap.stats().last_visited_cells, 3);

    let mut values = Vec::new();
    let mut cursor = Some(head);
    while let Some(node) = cursor {
        // SAFETY: every node in the chain is reachable from a protected cell.
        let node = unsafe { node.get() };
        values.push(node.value);
        cursor = node.next;
    }
    assert_eq!(values, vec![1, 2, 3]);

    heap.destroy().unwrap();
}

#[test]
fn test_eden_collection_follows_dirty_cards() {
    let heap = Heap::new(HeapConfig {
        collect_on_allocation: false,
        generational_barrier: true,
        ..HeapConfig::default()
    })
    .unwrap();

    let old = heap.allocate_cell(Node {
        next: None,
        value: 1,
    });
    heap.protect_cell(old);
    heap.collect_all_garbage();

    let young = heap.allocate_cell(Node {
        next: None,
        value: 2,
    });
    heap.allocate_cell(Node {
        next: None,
        value: 3,
    });
    // SAFETY: old is protected and no collection is running.
    unsafe { old.get_mut().next = Some(young) };
    heap.write_barrier_cell(old, young);

    heap.collect_eden();

    let stats = heap.stats();
    assert_eq!(stats.eden_collection_count, 1);
    assert_eq!(stats.collection_count, 2);
    assert_eq!(heap.object_count(), 2);
    assert!(heap.is_heap_cell(young.address()));
    // SAFETY: young is reachable from old.
    assert_eq!(unsafe { young.get().value }, 2);
    assert_eq!(heap.write_barrier_count(), 1);

    heap.destroy().unwrap();
}

static SWEPT_DROPS: AtomicUsize = AtomicUsize::new(0);

struct Tracked;

impl Trace for Tracked {}

impl Drop for Tracked {
    fn drop(&mut self) {
        SWEPT_DROPS.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_destructors_run_on_sweep_and_destroy() {
    let heap = manual_heap();
    let cells: Vec<_> = (0..10).map(|_| heap.allocate_cell(Tracked)).collect();
    for cell in &cells[..3] {
        heap.protect_cell(*cell);
    }

    heap.collect_all_garbage();
    assert_eq!(SWEPT_DROPS.load(Ordering::SeqCst), 7);

    heap.destroy().unwrap();
    assert_eq!(SWEPT_DROPS.load(Ordering::SeqCst), 10);
    assert!(matches!(heap.destroy(), Err(HeapError::Destroyed)));
}

#[test]
fn test_type_count_histograms() {
    let heap = manual_heap();
    let name = heap.allocate_cell(String::from("otter"));
    heap.allocate_cell(String::from("dropped"));
    heap.allocate_cell(42u64);
    heap.allocate(48);
    heap.protect_cell(name);

    let counts = heap.object_type_counts();
    assert_eq!(counts[std::any::type_name::<String>()], 2);
    assert_eq!(counts[std::any::type_name::<u64>()], 1);
    assert_eq!(counts["raw"], 1);

    let protected = heap.protected_object_type_counts();
    assert_eq!(protected.len(), 1);
    assert_eq!(protected[std::any::type_name::<String>()], 1);

    heap.collect_all_garbage();
    let counts = heap.object_type_counts();
    assert_eq!(counts.len(), 1);
    // SAFETY: protected.
    assert_eq!(unsafe { name.get() }, "otter");

    heap.destroy().unwrap();
}

#[test]
fn test_handle_scope_roots_cells() {
    let heap = manual_heap();
    let cell = heap.allocate(64).as_ptr() as usize;
    {
        let scope = heap.handles().scope();
        scope.push(cell);
        heap.collect_all_garbage();
        assert!(heap.is_heap_cell(cell));
    }
    assert!(heap.handles().is_empty());

    heap.collect_all_garbage();
    assert!(!heap.is_heap_cell(cell));

    heap.destroy().unwrap();
}

#[test]
fn test_defer_collection_suppresses_allocation_triggers() {
    let heap = Heap::new(HeapConfig {
        min_bytes_per_cycle: 4096,
        ..HeapConfig::default()
    })
    .unwrap();

    {
        let _deferred = heap.defer_collection();
        for _ in 0..3_000 {
            heap.allocate(32);
        }
        assert_eq!(heap.stats().collection_count, 0);
    }

    for _ in 0..3_000 {
        heap.allocate(32);
    }
    assert!(heap.stats().collection_count >= 1);

    heap.destroy().unwrap();
}

#[test]
fn test_concurrent_allocation() {
    let heap = Arc::new(manual_heap());

    thread::scope(|scope| {
        for worker in 0..4u64 {
            let heap = &heap;
            scope.spawn(move || {
                for value in 0..500 {
                    let cell = heap.allocate_cell(Node {
                        next: None,
                        value: worker * 1_000 + value,
                    });
                    if value % 5 == 0 {
                        heap.protect_cell(cell);
                    }
                }
            });
        }
    });

    assert_eq!(heap.object_count(), 2_000);
    heap.collect_all_garbage();
    assert_eq!(heap.object_count(), 400);

    heap.destroy().unwrap();
}

#[test]
fn test_root_provider_removal() {
    let heap = manual_heap();
    let cell = heap.allocate(16).as_ptr() as usize;
    let roots = Arc::new(ConservativeWords::default());
    roots.words.lock().push(cell);

    let provider: Arc<dyn RootProvider> = roots;
    heap.add_root_provider(provider.clone());
    heap.collect_all_garbage();
    assert!(heap.is_heap_cell(cell));

    assert!(heap.remove_root_provider(&provider));
    assert!(!heap.remove_root_provider(&provider));
    heap.collect_all_garbage();
    assert!(!heap.is_heap_cell(cell));

    heap.destroy().unwrap();
}
