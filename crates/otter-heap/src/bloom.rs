//! A one-word bloom filter over block addresses.
//!
//! Block addresses are `BLOCK_SIZE` aligned, so their low bits are always
//! zero and the OR of every address added is a cheap superset summary. A
//! candidate with a bit set that no added address has cannot be one of them.

/// Single-word bloom filter used to reject non-block addresses quickly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TinyBloomFilter {
    bits: usize,
}

impl TinyBloomFilter {
    /// Filter with no bits set.
    pub const fn new() -> Self {
        Self { bits: 0 }
    }

    /// Record `bits` as present.
    #[inline]
    pub fn add(&mut self, bits: usize) {
        self.bits |= bits;
    }

    /// Merge another filter into this one.
    #[inline]
    pub fn add_filter(&mut self, other: &TinyBloomFilter) {
        self.bits |= other.bits;
    }

    /// True when `bits` was definitely never added.
    ///
    /// False positives are possible, false negatives are not. Zero is
    /// always ruled out since no block lives at address zero.
    #[inline]
    pub fn rule_out(&self, bits: usize) -> bool {
        if bits == 0 {
            return true;
        }
        (bits & self.bits) != bits
    }

    /// Forget everything added.
    #[inline]
    pub fn reset(&mut self) {
        self.bits = 0;
    }

    /// Raw filter word.
    #[inline]
    pub fn bits(&self) -> usize {
        self.bits
    }
}
