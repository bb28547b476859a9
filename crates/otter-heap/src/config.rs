//! Heap configuration
//!
//! Defaults are tuned for an embedded interpreter. Every field can be
//! overridden from the environment:
//!
//! | Variable | Field |
//! |---|---|
//! | `OTTER_HEAP_MIN_BYTES` | `min_bytes_per_cycle` |
//! | `OTTER_HEAP_GENERATIONAL` | `generational_barrier` |
//! | `OTTER_HEAP_FREE_INTERVAL_MS` | `block_freeing_interval` |
//! | `OTTER_HEAP_COLLECT_ON_ALLOC` | `collect_on_allocation` |

use std::time::Duration;

use crate::error::{HeapError, Result};

/// Default allocation budget between collections: 512KB.
pub const DEFAULT_MIN_BYTES_PER_CYCLE: usize = 512 * 1024;

/// Default wake-up interval of the block freeing thread.
pub const DEFAULT_BLOCK_FREEING_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration for a [`Heap`](crate::Heap)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapConfig {
    /// Floor for the number of bytes allocated between collections
    pub min_bytes_per_cycle: usize,
    /// Record old-to-young stores in card sets and allow eden collections
    pub generational_barrier: bool,
    /// How often the block freeing thread trims the free block pool
    pub block_freeing_interval: Duration,
    /// Let allocation slow paths start a collection once the budget is spent
    pub collect_on_allocation: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            min_bytes_per_cycle: DEFAULT_MIN_BYTES_PER_CYCLE,
            generational_barrier: false,
            block_freeing_interval: DEFAULT_BLOCK_FREEING_INTERVAL,
            collect_on_allocation: true,
        }
    }
}

impl HeapConfig {
    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.min_bytes_per_cycle == 0 {
            return Err(HeapError::InvalidConfig(
                "min_bytes_per_cycle must be non-zero",
            ));
        }
        if self.block_freeing_interval.is_zero() {
            return Err(HeapError::InvalidConfig(
                "block_freeing_interval must be non-zero",
            ));
        }
        Ok(())
    }

    /// Defaults overridden by `OTTER_HEAP_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = lookup("OTTER_HEAP_MIN_BYTES") {
            config.min_bytes_per_cycle = value.trim().parse().map_err(|_| {
                HeapError::InvalidConfig("OTTER_HEAP_MIN_BYTES must be an unsigned integer")
            })?;
        }
        if let Some(value) = lookup("OTTER_HEAP_GENERATIONAL") {
            config.generational_barrier = parse_flag(&value).ok_or(HeapError::InvalidConfig(
                "OTTER_HEAP_GENERATIONAL must be a boolean",
            ))?;
        }
        if let Some(value) = lookup("OTTER_HEAP_FREE_INTERVAL_MS") {
            let millis: u64 = value.trim().parse().map_err(|_| {
                HeapError::InvalidConfig("OTTER_HEAP_FREE_INTERVAL_MS must be an unsigned integer")
            })?;
            config.block_freeing_interval = Duration::from_millis(millis);
        }
        if let Some(value) = lookup("OTTER_HEAP_COLLECT_ON_ALLOC") {
            config.collect_on_allocation = parse_flag(&value).ok_or(
                HeapError::InvalidConfig("OTTER_HEAP_COLLECT_ON_ALLOC must be a boolean"),
            )?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
