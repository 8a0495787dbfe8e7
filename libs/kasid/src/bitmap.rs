// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::vec;
use alloc::vec::Vec;

const BITS_PER_WORD: usize = size_of::<usize>() * 8;

/// Tracks which hardware slots are taken in the current generation.
pub(crate) struct SlotBitmap {
    words: Vec<usize>,
    len: usize,
}

impl SlotBitmap {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(BITS_PER_WORD)],
            len,
        }
    }

    pub fn set(&mut self, slot: usize) {
        debug_assert!(slot < self.len);
        self.words[slot / BITS_PER_WORD] |= 1 << (slot % BITS_PER_WORD);
    }

    pub fn is_set(&self, slot: usize) -> bool {
        debug_assert!(slot < self.len);
        self.words[slot / BITS_PER_WORD] & (1 << (slot % BITS_PER_WORD)) != 0
    }

    pub fn clear_all(&mut self) {
        self.words.fill(0);
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// Returns the first clear slot at or after `start`.
    ///
    /// The search does not wrap around, slots below `start` are not considered.
    pub fn find_next_zero(&self, start: usize) -> Option<usize> {
        if start >= self.len {
            return None;
        }

        let mut index = start / BITS_PER_WORD;
        // ignore the bits below `start` in the first word
        let mut free = !self.words[index] & (usize::MAX << (start % BITS_PER_WORD));

        loop {
            if free != 0 {
                let slot = index * BITS_PER_WORD + free.trailing_zeros() as usize;
                return (slot < self.len).then_some(slot);
            }

            index += 1;
            free = !*self.words.get(index)?;
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn finds_first_free_slot() {
        let mut bitmap = SlotBitmap::new(16);
        bitmap.set(1);
        bitmap.set(2);
        bitmap.set(4);

        assert_eq!(bitmap.find_next_zero(1), Some(3));
        assert_eq!(bitmap.find_next_zero(4), Some(5));
        assert_eq!(bitmap.find_next_zero(0), Some(0));
        assert_eq!(bitmap.count_ones(), 3);
    }

    #[test]
    fn does_not_wrap() {
        let mut bitmap = SlotBitmap::new(4);
        bitmap.set(2);
        bitmap.set(3);

        assert_eq!(bitmap.find_next_zero(2), None);
        assert_eq!(bitmap.find_next_zero(4), None);
        assert_eq!(bitmap.find_next_zero(1), Some(1));
    }

    #[test]
    fn spans_multiple_words() {
        let len = 3 * BITS_PER_WORD;
        let mut bitmap = SlotBitmap::new(len);
        for slot in 1..len - 1 {
            bitmap.set(slot);
        }

        assert_eq!(bitmap.find_next_zero(1), Some(len - 1));
        bitmap.set(len - 1);
        assert_eq!(bitmap.find_next_zero(1), None);

        bitmap.clear_all();
        assert_eq!(bitmap.count_ones(), 0);
        assert!(!bitmap.is_set(BITS_PER_WORD));
    }

    #[test]
    fn ignores_padding_bits() {
        // 5 slots live in a single word, the upper bits of which are always clear
        let mut bitmap = SlotBitmap::new(5);
        for slot in 0..5 {
            bitmap.set(slot);
        }

        assert_eq!(bitmap.find_next_zero(0), None);
    }
}
