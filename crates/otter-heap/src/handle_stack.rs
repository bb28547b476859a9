//! Precise root stack for host code.
//!
//! Native code that holds cells across allocations pushes them here. A
//! [`HandleScope`] truncates the stack back to its starting depth when it
//! goes out of scope.

use parking_lot::Mutex;

use crate::cell::CellRef;

/// Shadow stack of cell addresses that are roots.
#[derive(Debug, Default)]
pub struct HandleStack {
    slots: Mutex<Vec<usize>>,
}

impl HandleStack {
    /// Empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a cell address. Returns its slot index.
    pub fn push(&self, addr: usize) -> usize {
        let mut slots = self.slots.lock();
        slots.push(addr);
        slots.len() - 1
    }

    /// Push a typed cell. Returns its slot index.
    pub fn push_cell<T>(&self, cell: CellRef<T>) -> usize {
        self.push(cell.address())
    }

    /// Address in slot `index`.
    pub fn get(&self, index: usize) -> Option<usize> {
        self.slots.lock().get(index).copied()
    }

    /// Overwrite a slot, e.g. when the host swaps the value it holds.
    pub fn set(&self, index: usize, addr: usize) -> bool {
        match self.slots.lock().get_mut(index) {
            Some(slot) => {
                *slot = addr;
                true
            }
            None => false,
        }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether the stack is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every slot at or above `len`.
    pub fn truncate(&self, len: usize) {
        self.slots.lock().truncate(len);
    }

    /// Open a scope that pops everything pushed through it on drop.
    pub fn scope(&self) -> HandleScope<'_> {
        HandleScope {
            stack: self,
            depth: self.len(),
        }
    }

    /// Copy of the current slots, taken at the start of marking.
    pub(crate) fn snapshot(&self) -> Vec<usize> {
        self.slots.lock().clone()
    }
}

/// Guard restoring the handle stack depth on drop.
pub struct HandleScope<'a> {
    stack: &'a HandleStack,
    depth: usize,
}

impl HandleScope<'_> {
    /// Push a cell address. Returns its slot index.
    pub fn push(&self, addr: usize) -> usize {
        self.stack.push(addr)
    }

    /// Push a typed cell. Returns its slot index.
    pub fn push_cell<T>(&self, cell: CellRef<T>) -> usize {
        self.stack.push_cell(cell)
    }

    /// Depth the stack returns to when the scope ends
    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl Drop for HandleScope<'_> {
    fn drop(&mut self) {
        self.stack.truncate(self.depth);
    }
}
