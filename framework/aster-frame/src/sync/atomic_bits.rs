// SPDX-License-Identifier: MPL-2.0

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

/// A fixed-size bitset whose bits can be set, cleared, and tested with
/// atomic, per-bit operations.
pub struct AtomicBits {
    words: Vec<AtomicU64>,
    num_bits: usize,
}

const BITS_PER_WORD: usize = u64::BITS as usize;

impl AtomicBits {
    /// Creates a bitset of `num_bits` bits, all initially clear.
    pub fn new(num_bits: usize) -> Self {
        let num_words = num_bits.div_ceil(BITS_PER_WORD);
        let mut words = Vec::with_capacity(num_words);
        words.resize_with(num_words, || AtomicU64::new(0));
        Self { words, num_bits }
    }

    pub fn len(&self) -> usize {
        self.num_bits
    }

    pub fn is_empty(&self) -> bool {
        self.num_bits == 0
    }

    /// Sets bit `index`, returning its previous value.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn set(&self, index: usize, value: bool) -> bool {
        assert!(index < self.num_bits);
        let word = &self.words[index / BITS_PER_WORD];
        let mask = 1u64 << (index % BITS_PER_WORD);
        let old = if value {
            word.fetch_or(mask, Ordering::AcqRel)
        } else {
            word.fetch_and(!mask, Ordering::AcqRel)
        };
        old & mask != 0
    }

    /// Returns the value of bit `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.num_bits);
        let word = &self.words[index / BITS_PER_WORD];
        let mask = 1u64 << (index % BITS_PER_WORD);
        word.load(Ordering::Acquire) & mask != 0
    }
}
