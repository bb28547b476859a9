//! # Otter Heap
//!
//! Garbage-collected heap for the Otter VM.
//!
//! ## Design
//!
//! - **Cells**: Fixed-size cells in 64KB blocks, grouped into size classes
//!   and marked in place (mark-sweep with lazy free-list sweeping)
//! - **Storage**: Variable-sized buffers bump allocated in a copying space;
//!   large buffers get their own oversize block
//! - **Roots**: Protect counts, a handle stack, host root providers and
//!   conservative word spans (which pin the storage blocks they hit)
//! - **Generations**: Optional card-marking barrier for eden collections
//! - **Memory return**: A background thread halves the free block pool

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod allocation_space;
pub mod block;
pub mod block_pool;
pub mod block_set;
pub mod bloom;
pub mod bump_space;
pub mod card_set;
pub mod cell;
pub mod config;
pub mod conservative_roots;
pub mod error;
pub mod handle_stack;
pub mod heap;
pub mod marked_block;
pub mod marked_space;
pub mod visitor;

pub use block::BLOCK_SIZE;
pub use bump_space::OVERSIZE_THRESHOLD;
pub use cell::{CellMeta, CellRef, Trace};
pub use config::HeapConfig;
pub use error::{HeapError, Result};
pub use handle_stack::{HandleScope, HandleStack};
pub use heap::{
    CollectionScope, DeferCollection, Heap, HeapStats, OperationInProgress, RootProvider,
    SweepToggle,
};
pub use marked_space::MAX_CELL_SIZE;
pub use visitor::SlotVisitor;
