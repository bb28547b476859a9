//! Heap error types

use thiserror::Error;

/// Errors reported by the heap.
///
/// Must-succeed allocation paths never return these; they log and abort
/// through [`crash_on_out_of_memory`] instead.
#[derive(Debug, Error)]
pub enum HeapError {
    /// The OS refused to provide memory for a can-fail allocation
    #[error("out of memory allocating {requested} bytes")]
    OutOfMemory {
        /// Size of the request that failed
        requested: usize,
    },

    /// A configuration value was rejected
    #[error("invalid heap configuration: {0}")]
    InvalidConfig(&'static str),

    /// The heap was already torn down
    #[error("heap has been destroyed")]
    Destroyed,

    /// The block freeing thread could not be started
    #[error("failed to spawn block freeing thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    /// The block freeing thread panicked before it was joined
    #[error("block freeing thread panicked")]
    BlockFreeingThreadPanicked,
}

/// Result type for heap operations
pub type Result<T> = std::result::Result<T, HeapError>;

/// Terminate the process after a must-succeed allocation failed.
#[cold]
#[inline(never)]
pub(crate) fn crash_on_out_of_memory(requested: usize) -> ! {
    tracing::error!(
        target: "otter::heap",
        requested,
        "out of memory in a must-succeed allocation"
    );
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = HeapError::OutOfMemory { requested: 128 };
        assert_eq!(err.to_string(), "out of memory allocating 128 bytes");

        let err = HeapError::InvalidConfig("min_bytes_per_cycle must be non-zero");
        assert!(err.to_string().contains("min_bytes_per_cycle"));
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::other("no threads left");
        let err: HeapError = io.into();
        assert!(matches!(err, HeapError::ThreadSpawn(_)));
    }
}
