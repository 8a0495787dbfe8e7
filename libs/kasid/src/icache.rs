// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use lock_api::RawMutex;

use crate::arch::Arch;
use crate::context::MmContext;
#[cfg(feature = "counters")]
use crate::counters::Counters;
use crate::cpu_set::{CpuId, CpuMask};
use crate::manager::TagManager;
use crate::shootdown::Strategy;

impl<A: Arch, R: RawMutex> TagManager<A, R> {
    /// Records that instructions of `mm` were modified by `cpu`.
    ///
    /// `cpu` synchronizes its own instruction cache right away. Every other processor does so the
    /// next time it switches to `mm`.
    pub fn mark_stale(&self, mm: &MmContext, cpu: CpuId) {
        // Neither residency nor cache membership remembers every processor that ever executed
        // `mm`, so all of them are marked.
        let stale = CpuMask::first(self.possible_cpus()).without(cpu);

        // Marks from earlier calls are kept, including one for `cpu` itself. It is consumed at the
        // next switch to `mm`, an extra flush at worst.
        mm.icache_stale.insert_all(&stale);
        self.arch.fence_i(cpu);
    }

    /// Like [`TagManager::mark_stale`] but also synchronizes the processors currently running
    /// `mm` right away instead of waiting for their next context switch.
    pub fn flush_icache_mm(&self, mm: &MmContext, cpu: CpuId) {
        self.mark_stale(mm, cpu);

        let others = mm.residency.load().without(cpu);
        if !others.is_empty() {
            log::trace!("synchronizing instruction caches on {others:?}");
            self.shootdown.flush_icache(&self.arch, Some(&others));
        }
    }

    /// Synchronizes the instruction cache of `cpu` if it was marked stale for `mm`, returning
    /// whether it was.
    ///
    /// At most one flush happens per marking, no matter how often this is called.
    pub fn consume_if_stale(&self, mm: &MmContext, cpu: CpuId) -> bool {
        if !mm.icache_stale.take(cpu) {
            return false;
        }

        #[cfg(feature = "counters")]
        Counters::bump(&self.counters.icache_flushes);

        self.arch.fence_i(cpu);
        true
    }

    /// Synchronizes the instruction caches of every processor, for kernel code modifications.
    pub fn flush_icache_all(&self) {
        log::trace!("synchronizing all instruction caches");
        self.shootdown.flush_icache(&self.arch, None);
    }
}
