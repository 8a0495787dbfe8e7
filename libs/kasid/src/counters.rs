// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{AtomicU64, Ordering};

/// Event counters, only tracked with the `counters` feature enabled.
pub(crate) struct Counters {
    pub fast_path: AtomicU64,
    pub slow_path: AtomicU64,
    pub allocations: AtomicU64,
    pub rollovers: AtomicU64,
    pub epoch_overflows: AtomicU64,
    pub full_flushes: AtomicU64,
    pub range_flushes: AtomicU64,
    pub icache_flushes: AtomicU64,
}

/// A point-in-time copy of the event counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Context switches that installed an existing tag without taking the lock.
    pub fast_path: u64,
    /// Context switches that took the allocator lock.
    pub slow_path: u64,
    /// Tags handed out by the allocator, including reuses of reserved tags.
    pub allocations: u64,
    pub rollovers: u64,
    /// Rollovers that wrapped the generation counter and swept all address spaces.
    pub epoch_overflows: u64,
    pub full_flushes: u64,
    pub range_flushes: u64,
    /// Deferred instruction cache flushes performed during context switches.
    pub icache_flushes: u64,
}

impl Counters {
    pub fn new() -> Self {
        Self {
            fast_path: AtomicU64::new(0),
            slow_path: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
            rollovers: AtomicU64::new(0),
            epoch_overflows: AtomicU64::new(0),
            full_flushes: AtomicU64::new(0),
            range_flushes: AtomicU64::new(0),
            icache_flushes: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            fast_path: self.fast_path.load(Ordering::Relaxed),
            slow_path: self.slow_path.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            rollovers: self.rollovers.load(Ordering::Relaxed),
            epoch_overflows: self.epoch_overflows.load(Ordering::Relaxed),
            full_flushes: self.full_flushes.load(Ordering::Relaxed),
            range_flushes: self.range_flushes.load(Ordering::Relaxed),
            icache_flushes: self.icache_flushes.load(Ordering::Relaxed),
        }
    }
}
