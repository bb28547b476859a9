//! Marking visitor.
//!
//! The visitor holds the mark stack. Roots and outgoing references are
//! appended; `drain` pops cells and runs their trace functions until the
//! stack is empty. During full collections it also evacuates the storage
//! buffers that traced cells report through `visit_storage`.

use crate::bump_space::CopyCursor;
use crate::cell::CellRef;
use crate::marked_space::MarkedSpace;

/// Marking statistics for one cycle
#[derive(Debug, Default, Clone, Copy)]
pub struct VisitStats {
    /// Cells traced
    pub visited_cells: usize,
    /// Bytes of cells traced
    pub visited_bytes: usize,
    /// Storage bytes evacuated
    pub copied_bytes: usize,
}

/// Mark stack and storage copier for one collection.
pub struct SlotVisitor<'a> {
    space: &'a mut MarkedSpace,
    copier: Option<CopyCursor<'a>>,
    mark_stack: Vec<usize>,
    stats: VisitStats,
}

impl<'a> SlotVisitor<'a> {
    /// `copier` is `None` when the cycle does not evacuate storage.
    pub fn new(space: &'a mut MarkedSpace, copier: Option<CopyCursor<'a>>) -> Self {
        Self {
            space,
            copier,
            mark_stack: Vec::new(),
            stats: VisitStats::default(),
        }
    }

    /// Mark the cell at `addr` and queue it for tracing.
    ///
    /// Addresses that are not the start of an allocated cell are ignored,
    /// as are cells already marked.
    pub fn append(&mut self, addr: usize) {
        let Some(block) = self.space.block_for_mut(addr) else {
            return;
        };
        let Some(index) = block.cell_index(addr) else {
            return;
        };
        if block.is_zapped(index) || block.test_and_set_marked(index) {
            return;
        }
        self.mark_stack.push(addr);
    }

    /// Typed form of [`SlotVisitor::append`].
    #[inline]
    pub fn append_cell<T>(&mut self, cell: CellRef<T>) {
        self.append(cell.address());
    }

    /// Queue an already-marked cell to be traced again.
    pub fn rescan(&mut self, addr: usize) {
        self.mark_stack.push(addr);
    }

    /// Report a storage buffer owned by the cell being traced.
    ///
    /// When the buffer is evacuated `slot` is updated to its new address.
    pub fn visit_storage(&mut self, slot: &mut *mut u8, bytes: usize) {
        let Some(copier) = self.copier.as_mut() else {
            return;
        };
        if let Some(moved) = copier.copy(*slot, bytes) {
            *slot = moved.as_ptr();
        }
    }

    /// Whether this cycle evacuates storage
    pub fn is_copying(&self) -> bool {
        self.copier.is_some()
    }

    /// Trace queued cells until the mark stack is empty.
    pub fn drain(&mut self) {
        while let Some(addr) = self.mark_stack.pop() {
            let Some(block) = self.space.block_for(addr) else {
                continue;
            };
            let cell_size = block.cell_size();
            let Some(meta) = block.cell_index(addr).and_then(|index| block.cell_meta(index)) else {
                continue;
            };

            self.stats.visited_cells += 1;
            self.stats.visited_bytes += cell_size;

            if let Some(trace) = meta.trace {
                // SAFETY: the cell holds an initialized object of the type
                // its trace function was created for.
                unsafe { trace(addr as *mut u8, self) };
            }
        }
    }

    /// Cells queued but not yet traced.
    pub fn mark_stack_len(&self) -> usize {
        self.mark_stack.len()
    }

    /// Hand back the copy block and report statistics.
    pub fn finish(mut self) -> VisitStats {
        debug_assert!(self.mark_stack.is_empty(), "finished with a non-empty mark stack");
        if let Some(copier) = self.copier.take() {
            self.stats.copied_bytes = copier.finish();
        }
        self.stats
    }
}
