//! Per-block card set for the generational write barrier.
//!
//! A block is divided into fixed-size cards. When a store makes an
//! already-marked (old) cell point at something, the card holding that cell
//! is flagged dirty; an eden collection then rescans the marked cells of
//! dirty cards as extra roots.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::block::BLOCK_SIZE;

/// Size of a card in bytes
pub const CARD_SIZE: usize = 256;

/// Number of cards covering one standard block
pub const CARDS_PER_BLOCK: usize = BLOCK_SIZE / CARD_SIZE;

/// Card state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    /// No store into this card since the last collection
    Clean = 0,
    /// An old cell in this card was written to
    Dirty = 1,
}

/// Dirty flags for the cards of one block.
///
/// Cards are atomics so a barrier can flag a card through a shared
/// reference to the block.
pub struct CardSet {
    cards: Box<[AtomicU8]>,
}

impl CardSet {
    /// All cards clean.
    pub fn new() -> Self {
        Self {
            cards: (0..CARDS_PER_BLOCK)
                .map(|_| AtomicU8::new(CardState::Clean as u8))
                .collect(),
        }
    }

    /// Card index covering a byte offset within the block
    #[inline]
    pub fn card_for_offset(offset: usize) -> usize {
        offset / CARD_SIZE
    }

    /// Byte offsets `[start, end)` covered by a card
    #[inline]
    pub fn card_range(index: usize) -> (usize, usize) {
        let start = index * CARD_SIZE;
        (start, start + CARD_SIZE)
    }

    /// Flag the card covering `offset` as dirty.
    #[inline]
    pub fn mark_card_for(&self, offset: usize) {
        if let Some(card) = self.cards.get(Self::card_for_offset(offset)) {
            card.store(CardState::Dirty as u8, Ordering::Relaxed);
        }
    }

    /// Whether card `index` is dirty.
    pub fn is_card_marked(&self, index: usize) -> bool {
        self.cards
            .get(index)
            .is_some_and(|card| card.load(Ordering::Relaxed) == CardState::Dirty as u8)
    }

    /// Mark card `index` clean.
    pub fn clear_card(&self, index: usize) {
        if let Some(card) = self.cards.get(index) {
            card.store(CardState::Clean as u8, Ordering::Relaxed);
        }
    }

    /// Clear all cards (after a collection)
    pub fn clear_all(&self) {
        for card in self.cards.iter() {
            card.store(CardState::Clean as u8, Ordering::Relaxed);
        }
    }

    /// Indices of dirty cards
    pub fn dirty_cards(&self) -> impl Iterator<Item = usize> + '_ {
        self.cards
            .iter()
            .enumerate()
            .filter(|(_, card)| card.load(Ordering::Relaxed) == CardState::Dirty as u8)
            .map(|(index, _)| index)
    }

    /// Number of dirty cards
    pub fn dirty_count(&self) -> usize {
        self.dirty_cards().count()
    }
}

impl Default for CardSet {
    fn default() -> Self {
        Self::new()
    }
}
