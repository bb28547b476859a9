//! Aligned heap blocks.
//!
//! Every block is obtained from the global allocator with a `BLOCK_SIZE`
//! aligned `Layout`, so masking any pointer into the first `BLOCK_SIZE` bytes
//! of a block yields the block's base address. Block metadata (mark bits, cell
//! metadata, bump offsets) lives out of line in the owning space; the block
//! itself is plain memory.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;

/// Size and alignment of a standard block: 64KB.
pub const BLOCK_SIZE: usize = 64 * 1024;

/// Mask that maps an interior pointer to its block base.
pub const BLOCK_MASK: usize = !(BLOCK_SIZE - 1);

/// Granularity of oversize block sizes.
pub const PAGE_SIZE: usize = 4096;

/// Base address of the block containing `addr`.
#[inline]
pub fn block_base(addr: usize) -> usize {
    addr & BLOCK_MASK
}

/// An owned, block-aligned memory region.
///
/// Dropping the block returns its memory to the OS allocator.
pub struct HeapBlock {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: a HeapBlock is a uniquely owned allocation; it carries no thread
// affinity and all access to its memory is synchronized by the owning space.
unsafe impl Send for HeapBlock {}
unsafe impl Sync for HeapBlock {}

impl HeapBlock {
    /// Allocate a standard block. Returns `None` when the OS refuses.
    pub fn allocate() -> Option<Self> {
        Self::allocate_with_size(BLOCK_SIZE)
    }

    /// Allocate a block large enough for `bytes`, rounded up to a page multiple.
    pub fn allocate_oversize(bytes: usize) -> Option<Self> {
        let size = bytes.max(1).checked_next_multiple_of(PAGE_SIZE)?;
        Self::allocate_with_size(size)
    }

    fn allocate_with_size(size: usize) -> Option<Self> {
        let layout = Layout::from_size_align(size, BLOCK_SIZE).ok()?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).map(|base| Self { base, size })
    }

    /// Pointer to the first byte of the block.
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Base address of the block.
    #[inline]
    pub fn address(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Size of the block in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the last byte of the block.
    #[inline]
    pub fn end(&self) -> usize {
        self.address() + self.size
    }

    /// Whether `addr` lies within this block.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.address() && addr < self.end()
    }

    /// Whether this block is larger than a standard block.
    #[inline]
    pub fn is_oversize(&self) -> bool {
        self.size > BLOCK_SIZE
    }
}

impl Drop for HeapBlock {
    fn drop(&mut self) {
        // SAFETY: base was allocated in `allocate_with_size` with this exact layout.
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.size, BLOCK_SIZE);
            alloc::dealloc(self.base.as_ptr(), layout);
        }
    }
}

impl fmt::Debug for HeapBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapBlock")
            .field("base", &format_args!("{:#x}", self.address()))
            .field("size", &self.size)
            .finish()
    }
}
