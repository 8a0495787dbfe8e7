// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ptr;

use lock_api::RawMutex;

use crate::allocator::TagAllocator;
use crate::arch::Arch;
use crate::context::MmContext;
#[cfg(feature = "counters")]
use crate::counters::Counters;
use crate::cpu_set::CpuId;
use crate::manager::TagManager;

impl<A: Arch, R: RawMutex> TagManager<A, R> {
    /// Switches `cpu` from address space `prev` to `next`.
    ///
    /// If `next` holds a tag of the current generation it is installed without taking any locks.
    /// Otherwise `next` gets a fresh tag, which may roll the allocator over to a new generation.
    /// Before returning, any instruction cache flush deferred for `next` on this processor is
    /// performed.
    ///
    /// While waiting for the allocator lock the processor keeps answering cross calls through
    /// [`Arch::poll_cross_calls`], so this may be called with interrupts disabled.
    ///
    /// # Safety
    ///
    /// Must be called on processor `cpu` with preemption disabled. `prev` must be the address
    /// space currently installed on `cpu` and `next` must hold the root of valid translation tables
    /// that map the calling code.
    ///
    /// # Panics
    ///
    /// Panics if the allocator runs out of tags right after a rollover or the generation counter
    /// overflows on a layout that does not support resetting it.
    pub unsafe fn activate(&self, prev: &MmContext, next: &MmContext, cpu: CpuId) {
        if ptr::eq(prev, next) {
            return;
        }

        prev.residency.remove(cpu);
        next.residency.insert(cpu);

        match &self.allocator {
            // Safety: ensured by caller
            Some(allocator) => unsafe { self.activate_tagged(allocator, next, cpu) },
            // Safety: ensured by caller
            None => unsafe { self.activate_untagged(prev, next, cpu) },
        }

        self.consume_if_stale(next, cpu);
    }

    unsafe fn activate_tagged(&self, allocator: &TagAllocator<R>, next: &MmContext, cpu: CpuId) {
        let table = allocator.table();
        let mut tag = next.tag();

        if table.try_fast_path(cpu, tag) {
            #[cfg(feature = "counters")]
            Counters::bump(&self.counters.fast_path);
        } else {
            let mut state = loop {
                if let Some(state) = allocator.try_lock() {
                    break state;
                }
                // a rollover holding the lock may be flushing through us
                self.arch.poll_cross_calls(cpu);
                core::hint::spin_loop();
            };

            #[cfg(feature = "counters")]
            Counters::bump(&self.counters.slow_path);

            // another processor may have assigned a tag while we waited for the lock
            tag = next.tag();
            if !table.is_current(tag) {
                tag = allocator.allocate(&mut state, tag, self);

                #[cfg(feature = "counters")]
                Counters::bump(&self.counters.allocations);

                log::trace!("cpu {cpu} assigned tag {tag} to {:?}", next.root());

                // Processors that ran `next` under its old tag lost their entries with the
                // rollover that retired it.
                next.cache_membership.store(&next.residency.load());
                next.set_tag(tag);
            }

            table.set(cpu, tag);
        }

        next.cache_membership.insert(cpu);

        // Safety: ensured by caller, the slot is exclusively owned by `next` in this generation
        unsafe {
            self.arch
                .install(cpu, allocator.layout().slot(tag), next.root());
        }
    }

    unsafe fn activate_untagged(&self, prev: &MmContext, next: &MmContext, cpu: CpuId) {
        prev.cache_membership.remove(cpu);
        next.cache_membership.insert(cpu);

        // Safety: ensured by caller
        unsafe {
            self.arch.install(cpu, 0, next.root());
        }
        // every address space shares slot 0, so entries of `prev` must go
        self.arch.fence_tag(cpu, 0);
    }
}
