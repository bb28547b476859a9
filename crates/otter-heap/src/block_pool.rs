//! Pool of free standard blocks and the thread that trims it.
//!
//! Blocks released by either space land here first. A background thread
//! wakes up periodically and returns half of the pooled blocks to the OS,
//! so a burst of allocation after a collection can reuse blocks without
//! going back to the allocator, while an idle heap still gives memory back.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::block::HeapBlock;
use crate::error::Result;

struct PoolState {
    blocks: Vec<HeapBlock>,
    should_quit: bool,
}

/// Free standard blocks shared by the object space and the storage space.
pub struct BlockPool {
    state: Mutex<PoolState>,
    condition: Condvar,
}

impl BlockPool {
    /// Empty pool.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PoolState {
                blocks: Vec::new(),
                should_quit: false,
            }),
            condition: Condvar::new(),
        }
    }

    /// Take a pooled block, if any.
    pub fn take(&self) -> Option<HeapBlock> {
        self.state.lock().blocks.pop()
    }

    /// Take a pooled block, or allocate a new one. `None` means the OS refused.
    pub fn take_or_allocate(&self) -> Option<HeapBlock> {
        self.take().or_else(HeapBlock::allocate)
    }

    /// Return a standard block for reuse.
    pub fn give_back(&self, block: HeapBlock) {
        debug_assert!(!block.is_oversize(), "oversize blocks are never pooled");
        self.state.lock().blocks.push(block);
    }

    /// Free every pooled block. Returns how many were freed.
    pub fn release_all(&self) -> usize {
        let blocks = std::mem::take(&mut self.state.lock().blocks);
        // Dropped outside the lock
        blocks.len()
    }

    /// Number of pooled blocks.
    pub fn len(&self) -> usize {
        self.state.lock().blocks.len()
    }

    /// Whether the pool holds no blocks.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ask the freeing thread to exit and wake it up.
    pub(crate) fn request_quit(&self) {
        self.state.lock().should_quit = true;
        self.condition.notify_all();
    }

    /// Body of the block freeing thread.
    ///
    /// Every `interval` the pool is halved, one block at a time, so the lock
    /// is never held across a deallocation.
    pub(crate) fn run_freeing_loop(&self, interval: Duration) {
        loop {
            {
                let mut state = self.state.lock();
                if state.should_quit {
                    break;
                }
                self.condition.wait_for(&mut state, interval);
                if state.should_quit {
                    break;
                }
            }

            let desired = self.len() / 2;
            let mut freed = 0usize;
            loop {
                let block = {
                    let mut state = self.state.lock();
                    if state.should_quit || state.blocks.len() <= desired {
                        None
                    } else {
                        state.blocks.pop()
                    }
                };
                match block {
                    Some(block) => {
                        drop(block);
                        freed += 1;
                    }
                    None => break,
                }
            }

            if freed > 0 {
                tracing::trace!(
                    target: "otter::heap",
                    freed,
                    pooled = self.len(),
                    "released pooled blocks"
                );
            }
        }
    }
}

impl Default for BlockPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the block freeing thread for `pool`.
pub(crate) fn spawn_block_freeing_thread(
    pool: Arc<BlockPool>,
    interval: Duration,
) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("otter-heap-block-freeing".to_string())
        .spawn(move || pool.run_freeing_loop(interval))?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_take_or_allocate_prefers_pool() {
        let pool = BlockPool::new();
        let block = HeapBlock::allocate().unwrap();
        let address = block.address();
        pool.give_back(block);
        assert_eq!(pool.len(), 1);

        let reused = pool.take_or_allocate().unwrap();
        assert_eq!(reused.address(), address);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_release_all() {
        let pool = BlockPool::new();
        for _ in 0..4 {
            pool.give_back(HeapBlock::allocate().unwrap());
        }
        assert_eq!(pool.release_all(), 4);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_freeing_thread_halves_pool() {
        let pool = Arc::new(BlockPool::new());
        for _ in 0..8 {
            pool.give_back(HeapBlock::allocate().unwrap());
        }

        let handle =
            spawn_block_freeing_thread(Arc::clone(&pool), Duration::from_millis(10)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.len() > 4 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(pool.len() <= 4);

        pool.request_quit();
        handle.join().unwrap();
    }

    #[test]
    fn test_quit_wakes_thread_immediately() {
        let pool = Arc::new(BlockPool::new());
        let handle =
            spawn_block_freeing_thread(Arc::clone(&pool), Duration::from_secs(3600)).unwrap();

        let start = Instant::now();
        pool.request_quit();
        handle.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(60));
    }
}
