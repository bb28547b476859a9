//! Cell types: the `Trace` trait, typed cell handles and per-cell metadata.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::visitor::SlotVisitor;

/// Type-erased destructor for a cell
pub type DropFn = unsafe fn(*mut u8);

/// Type-erased trace function for a cell
pub type TraceFn = unsafe fn(*mut u8, &mut SlotVisitor<'_>);

/// Objects stored in heap cells.
///
/// `trace` reports every outgoing reference: cells through
/// [`SlotVisitor::append`] / [`SlotVisitor::append_cell`], and storage
/// buffers through [`SlotVisitor::visit_storage`], which may rewrite the
/// slot when the buffer is evacuated.
pub trait Trace {
    /// Report outgoing references. Leaf types keep the empty default.
    fn trace(&mut self, _visitor: &mut SlotVisitor<'_>) {}
}

macro_rules! impl_leaf_trace {
    ($($ty:ty),* $(,)?) => {
        $(impl Trace for $ty {})*
    };
}

impl_leaf_trace!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    usize,
    i8,
    i16,
    i32,
    i64,
    isize,
    f32,
    f64,
    String,
);

impl<T: Trace> Trace for Option<T> {
    fn trace(&mut self, visitor: &mut SlotVisitor<'_>) {
        if let Some(value) = self {
            value.trace(visitor);
        }
    }
}

impl<T: Trace> Trace for Vec<T> {
    fn trace(&mut self, visitor: &mut SlotVisitor<'_>) {
        for value in self {
            value.trace(visitor);
        }
    }
}

impl<T> Trace for CellRef<T> {
    fn trace(&mut self, visitor: &mut SlotVisitor<'_>) {
        visitor.append_cell(*self);
    }
}

/// Out-of-line metadata recorded for every allocated cell.
///
/// A cell whose metadata is `None` is zapped: its object was destroyed or
/// never constructed.
#[derive(Clone, Copy)]
pub struct CellMeta {
    /// Reports references; `None` for raw cells
    pub trace: Option<TraceFn>,
    /// Runs the destructor in place; `None` when the type needs no drop
    pub drop: Option<DropFn>,
    /// Type name for heap histograms
    pub type_name: &'static str,
}

impl CellMeta {
    /// Metadata for untyped cells handed out by [`Heap::allocate`](crate::Heap::allocate).
    pub const RAW: CellMeta = CellMeta {
        trace: None,
        drop: None,
        type_name: "raw",
    };

    /// Metadata for a cell holding a `T`.
    pub fn of<T: Trace + 'static>() -> Self {
        Self {
            trace: Some(trace_cell::<T> as TraceFn),
            drop: std::mem::needs_drop::<T>().then_some(drop_cell::<T> as DropFn),
            type_name: std::any::type_name::<T>(),
        }
    }
}

impl fmt::Debug for CellMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellMeta")
            .field("type_name", &self.type_name)
            .field("traced", &self.trace.is_some())
            .field("dropped", &self.drop.is_some())
            .finish()
    }
}

unsafe fn trace_cell<T: Trace>(ptr: *mut u8, visitor: &mut SlotVisitor<'_>) {
    // SAFETY: the cell was initialized with a T by Heap::allocate_cell and is
    // only traced while the collector holds the object space lock.
    unsafe { (*ptr.cast::<T>()).trace(visitor) }
}

unsafe fn drop_cell<T>(ptr: *mut u8) {
    // SAFETY: called exactly once, when the cell is swept or the heap is destroyed.
    unsafe { std::ptr::drop_in_place(ptr.cast::<T>()) }
}

/// Handle to a heap cell holding a `T`.
///
/// A `CellRef` does not keep its cell alive; the cell must be reachable
/// from a root (protect count, handle stack, root provider or another live
/// cell) for as long as the handle is dereferenced.
pub struct CellRef<T> {
    ptr: NonNull<T>,
    _marker: PhantomData<*mut T>,
}

// SAFETY: cells are only created for `T: Send`, and dereferencing a CellRef
// is unsafe; synchronizing access to the pointee is the caller's job.
unsafe impl<T: Send> Send for CellRef<T> {}
unsafe impl<T: Send + Sync> Sync for CellRef<T> {}

impl<T> CellRef<T> {
    pub(crate) fn from_raw(ptr: NonNull<T>) -> Self {
        Self {
            ptr,
            _marker: PhantomData,
        }
    }

    /// Rebuild a handle from an address previously obtained from [`CellRef::address`].
    ///
    /// # Safety
    /// `addr` must be the address of a live cell holding a `T`.
    pub unsafe fn from_address(addr: usize) -> Option<Self> {
        NonNull::new(addr as *mut T).map(Self::from_raw)
    }

    /// Address of the cell
    #[inline]
    pub fn address(self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Raw pointer to the cell contents.
    #[inline]
    pub fn as_ptr(self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// Borrow the cell's value.
    ///
    /// # Safety
    /// The cell must still be live and not mutably borrowed elsewhere.
    #[inline]
    pub unsafe fn get<'a>(self) -> &'a T {
        // SAFETY: upheld by the caller.
        unsafe { self.ptr.as_ref() }
    }

    /// Mutably borrow the cell's value.
    ///
    /// # Safety
    /// The cell must still be live and not borrowed elsewhere.
    #[inline]
    pub unsafe fn get_mut<'a>(mut self) -> &'a mut T {
        // SAFETY: upheld by the caller.
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Clone for CellRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for CellRef<T> {}

impl<T> PartialEq for CellRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for CellRef<T> {}

impl<T> Hash for CellRef<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ptr.hash(state);
    }
}

impl<T> fmt::Debug for CellRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CellRef({:#x})", self.address())
    }
}
