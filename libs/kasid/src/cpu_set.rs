// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::iter::FusedIterator;

use crate::loom::sync::atomic::{AtomicUsize, Ordering};

/// The maximum number of processors supported.
pub const MAX_CPUS: usize = 256;

const BITS_PER_WORD: usize = size_of::<usize>() * 8;
const WORDS: usize = MAX_CPUS.div_ceil(BITS_PER_WORD);

/// Identifier of a processor (a hart on RISC-V).
///
/// Identifiers are dense, `0..possible_cpus` and smaller than [`MAX_CPUS`].
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CpuId(usize);

impl CpuId {
    #[must_use]
    pub const fn new(inner: usize) -> Self {
        Self(inner)
    }

    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }
}

impl fmt::Debug for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[cpu #{}]", self.0)
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

const fn locate(cpu: CpuId) -> (usize, usize) {
    assert!(cpu.0 < MAX_CPUS, "processor id out of range");
    (cpu.0 / BITS_PER_WORD, 1 << (cpu.0 % BITS_PER_WORD))
}

/// A plain set of processors.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CpuMask([usize; WORDS]);

impl CpuMask {
    #[must_use]
    pub const fn new() -> Self {
        Self([0; WORDS])
    }

    /// Returns the set of the first `count` processors.
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds [`MAX_CPUS`].
    #[must_use]
    pub fn first(count: usize) -> Self {
        assert!(count <= MAX_CPUS, "processor count out of range");
        (0..count).map(CpuId::new).collect()
    }

    #[must_use]
    pub fn single(cpu: CpuId) -> Self {
        let mut this = Self::new();
        this.insert(cpu);
        this
    }

    pub fn insert(&mut self, cpu: CpuId) {
        let (word, bit) = locate(cpu);
        self.0[word] |= bit;
    }

    pub fn remove(&mut self, cpu: CpuId) {
        let (word, bit) = locate(cpu);
        self.0[word] &= !bit;
    }

    #[must_use]
    pub fn contains(&self, cpu: CpuId) -> bool {
        let (word, bit) = locate(cpu);
        self.0[word] & bit != 0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|word| *word == 0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0
            .iter()
            .map(|word| word.count_ones() as usize)
            .sum()
    }

    #[must_use]
    pub fn union(mut self, other: &Self) -> Self {
        for (word, other) in self.0.iter_mut().zip(other.0) {
            *word |= other;
        }
        self
    }

    #[must_use]
    pub fn without(mut self, cpu: CpuId) -> Self {
        self.remove(cpu);
        self
    }

    /// The raw words of this set, bit `n` of word `i` is processor `i * usize::BITS + n`.
    ///
    /// This is the layout the SBI expects for hart masks.
    #[must_use]
    pub fn words(&self) -> &[usize] {
        &self.0
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            mask: self,
            next: 0,
        }
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(CpuId::get)).finish()
    }
}

impl FromIterator<CpuId> for CpuMask {
    fn from_iter<T: IntoIterator<Item = CpuId>>(iter: T) -> Self {
        let mut this = Self::new();
        for cpu in iter {
            this.insert(cpu);
        }
        this
    }
}

impl<'a> IntoIterator for &'a CpuMask {
    type Item = CpuId;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct Iter<'a> {
    mask: &'a CpuMask,
    next: usize,
}

impl Iterator for Iter<'_> {
    type Item = CpuId;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next < MAX_CPUS {
            let word = self.mask.0[self.next / BITS_PER_WORD] >> (self.next % BITS_PER_WORD);

            if word == 0 {
                // skip the rest of this word
                self.next = (self.next / BITS_PER_WORD + 1) * BITS_PER_WORD;
                continue;
            }

            let cpu = self.next + word.trailing_zeros() as usize;
            self.next = cpu + 1;
            return Some(CpuId(cpu));
        }

        None
    }
}

impl FusedIterator for Iter<'_> {}

/// A set of processors that can be updated concurrently.
///
/// Individual bit updates are atomic, multi-word snapshots taken with [`AtomicCpuSet::load`] are
/// not. A processor that joins the set concurrently with a snapshot may or may not be observed.
pub struct AtomicCpuSet([AtomicUsize; WORDS]);

impl AtomicCpuSet {
    pub fn new() -> Self {
        Self(core::array::from_fn(|_| AtomicUsize::new(0)))
    }

    pub fn insert(&self, cpu: CpuId) {
        let (word, bit) = locate(cpu);
        self.0[word].fetch_or(bit, Ordering::Relaxed);
    }

    pub fn remove(&self, cpu: CpuId) {
        let (word, bit) = locate(cpu);
        self.0[word].fetch_and(!bit, Ordering::Relaxed);
    }

    /// Clears `cpu` from the set, returning whether it was a member.
    ///
    /// Of any number of concurrent callers for the same processor at most one observes `true`.
    /// Pairs with the `Release` in [`AtomicCpuSet::insert_all`].
    pub fn take(&self, cpu: CpuId) -> bool {
        let (word, bit) = locate(cpu);
        self.0[word].fetch_and(!bit, Ordering::Acquire) & bit != 0
    }

    /// Adds every member of `mask` to the set.
    pub fn insert_all(&self, mask: &CpuMask) {
        for (word, bits) in self.0.iter().zip(mask.0) {
            if bits != 0 {
                word.fetch_or(bits, Ordering::Release);
            }
        }
    }

    /// Replaces the contents of the set with `mask`.
    pub fn store(&self, mask: &CpuMask) {
        for (word, bits) in self.0.iter().zip(mask.0) {
            word.store(bits, Ordering::Relaxed);
        }
    }

    pub fn clear(&self) {
        self.store(&CpuMask::new());
    }

    pub fn load(&self) -> CpuMask {
        let mut mask = CpuMask::new();
        for (bits, word) in mask.0.iter_mut().zip(&self.0) {
            *bits = word.load(Ordering::Relaxed);
        }
        mask
    }
}

impl Default for AtomicCpuSet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AtomicCpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load(), f)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn mask_iterates_in_order() {
        let mask: CpuMask = [3, 0, 64, 65, 255].map(CpuId::new).into_iter().collect();

        assert_eq!(mask.len(), 5);
        assert_eq!(
            mask.iter().map(CpuId::get).collect::<Vec<_>>(),
            [0, 3, 64, 65, 255]
        );
    }

    #[test]
    fn mask_set_operations() {
        let a = CpuMask::first(3);
        let b = CpuMask::single(CpuId::new(7));

        let both = a.union(&b).without(CpuId::new(1));
        assert!(both.contains(CpuId::new(0)));
        assert!(!both.contains(CpuId::new(1)));
        assert!(both.contains(CpuId::new(2)));
        assert!(both.contains(CpuId::new(7)));
        assert_eq!(both.len(), 3);

        assert!(CpuMask::new().is_empty());
        assert!(CpuMask::new().iter().next().is_none());
    }

    #[test]
    fn atomic_take_is_exactly_once() {
        let set = AtomicCpuSet::new();
        set.insert_all(&CpuMask::first(2));

        assert!(set.take(CpuId::new(1)));
        assert!(!set.take(CpuId::new(1)));
        assert_eq!(set.load(), CpuMask::single(CpuId::new(0)));
    }

    #[test]
    fn atomic_store_replaces() {
        let set = AtomicCpuSet::new();
        set.insert(CpuId::new(4));
        set.store(&CpuMask::single(CpuId::new(9)));

        assert_eq!(set.load(), CpuMask::single(CpuId::new(9)));

        set.clear();
        assert!(set.load().is_empty());
    }

    #[test]
    #[should_panic(expected = "processor id out of range")]
    fn out_of_range_cpu_panics() {
        let mut mask = CpuMask::new();
        mask.insert(CpuId::new(MAX_CPUS));
    }
}
