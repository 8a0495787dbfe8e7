// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// An address space tag: a generation in the high bits and a hardware slot in the low bits.
///
/// How many bits belong to the slot is decided at boot by the [`TagLayout`]. The all-zero tag,
/// [`Tag::NONE`], is never handed out and marks an address space that has not been assigned a
/// tag yet (or lost it during a generation reset).
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Tag(usize);

impl Tag {
    pub const NONE: Self = Self(0);

    #[must_use]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({:#x})", self.0)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// What happens when the generation counter runs out of bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wrap back to the first generation and sweep every live address space.
    Reset,
    /// Treat it as a fatal error. Chosen for generation counters wide enough that overflow cannot
    /// happen within the lifetime of the system.
    Fatal,
}

/// Splits a [`Tag`] into its generation and slot parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagLayout {
    slot_bits: u32,
    generation_bits: u32,
}

impl TagLayout {
    /// Generation counters narrower than this may overflow at runtime and use
    /// [`OverflowPolicy::Reset`].
    const WIDE_GENERATION_BITS: u32 = 32;

    /// Creates a new layout with `slot_bits` hardware tag bits.
    ///
    /// The generation counter occupies the remaining bits of the machine word unless
    /// `generation_bits` narrows it further.
    ///
    /// # Panics
    ///
    /// Panics if `slot_bits` is `0` or leaves no room for a generation counter.
    #[must_use]
    pub fn new(slot_bits: u32, generation_bits: Option<u32>) -> Self {
        assert!(
            slot_bits > 0 && slot_bits < usize::BITS,
            "invalid tag width {slot_bits}"
        );

        let max_generation_bits = usize::BITS - slot_bits;
        let generation_bits = generation_bits.map_or(max_generation_bits, |bits| {
            assert!(bits > 0, "generation counter must be at least one bit wide");
            bits.min(max_generation_bits)
        });

        Self {
            slot_bits,
            generation_bits,
        }
    }

    #[must_use]
    pub const fn slot_bits(&self) -> u32 {
        self.slot_bits
    }

    #[must_use]
    pub const fn generation_bits(&self) -> u32 {
        self.generation_bits
    }

    /// The number of hardware slots, including the reserved slot `0`.
    #[must_use]
    pub const fn slot_space(&self) -> usize {
        1 << self.slot_bits
    }

    #[must_use]
    pub const fn slot_mask(&self) -> usize {
        self.slot_space() - 1
    }

    /// The generation the allocator starts in. Generation bits of zero are never used.
    #[must_use]
    pub const fn first_generation(&self) -> usize {
        self.slot_space()
    }

    #[must_use]
    pub const fn slot(&self, tag: Tag) -> usize {
        tag.0 & self.slot_mask()
    }

    #[must_use]
    pub const fn generation(&self, tag: Tag) -> usize {
        tag.0 & !self.slot_mask()
    }

    #[must_use]
    pub fn compose(&self, generation: usize, slot: usize) -> Tag {
        debug_assert_eq!(generation & self.slot_mask(), 0);
        debug_assert!(slot <= self.slot_mask());
        Tag(generation | slot)
    }

    #[must_use]
    pub const fn overflow_policy(&self) -> OverflowPolicy {
        if self.generation_bits < Self::WIDE_GENERATION_BITS {
            OverflowPolicy::Reset
        } else {
            OverflowPolicy::Fatal
        }
    }

    /// Returns the generation following `generation`, or `None` if the counter overflowed.
    #[must_use]
    pub fn next_generation(&self, generation: usize) -> Option<usize> {
        let next = generation.checked_add(self.slot_space())?;

        if self.generation_bits < usize::BITS - self.slot_bits
            && (next >> self.slot_bits) >> self.generation_bits != 0
        {
            return None;
        }

        Some(next)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn compose_and_split() {
        let layout = TagLayout::new(4, None);

        assert_eq!(layout.slot_space(), 16);
        assert_eq!(layout.first_generation(), 16);

        let tag = layout.compose(layout.first_generation(), 5);
        assert_eq!(tag.get(), 0x15);
        assert_eq!(layout.slot(tag), 5);
        assert_eq!(layout.generation(tag), 16);
        assert!(Tag::NONE.is_none());
        assert_eq!(layout.generation(Tag::NONE), 0);
    }

    #[test]
    fn narrow_generation_overflows() {
        let layout = TagLayout::new(2, Some(2));
        assert_eq!(layout.overflow_policy(), OverflowPolicy::Reset);

        // generations 1, 2, 3 fit in two bits, generation 4 does not
        let mut generation = layout.first_generation();
        generation = layout.next_generation(generation).unwrap();
        generation = layout.next_generation(generation).unwrap();
        assert_eq!(generation, 3 << 2);
        assert_eq!(layout.next_generation(generation), None);
    }

    #[test]
    fn wide_generation_is_fatal() {
        let layout = TagLayout::new(16, None);

        assert_eq!(layout.generation_bits(), usize::BITS - 16);
        assert_eq!(layout.overflow_policy(), OverflowPolicy::Fatal);
        assert_eq!(layout.next_generation(usize::MAX & !layout.slot_mask()), None);
    }

    #[test]
    fn generation_bits_are_clamped() {
        let layout = TagLayout::new(8, Some(usize::BITS));
        assert_eq!(layout.generation_bits(), usize::BITS - 8);
    }

    #[test]
    #[should_panic(expected = "invalid tag width")]
    fn zero_width_is_rejected() {
        let _ = TagLayout::new(0, None);
    }
}
