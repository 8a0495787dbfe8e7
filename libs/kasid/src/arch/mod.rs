// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#[cfg(target_arch = "riscv64")]
pub mod riscv64;
pub mod satp;

use crate::address::{PhysicalAddress, VirtualAddress};
use crate::cpu_set::{CpuId, CpuMask};

/// The part of an address space a remote invalidation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushRange {
    /// Every address.
    All,
    /// The pages touched by `start..start + len`.
    Range { start: VirtualAddress, len: usize },
}

/// The hardware and firmware operations the tag manager is built on.
///
/// Methods that act on "the local processor" take the [`CpuId`] of the processor the caller is
/// executing on. Real hardware implementations only ever act on the current processor and may use
/// the parameter for debug checks, emulated implementations use it to pick which processor's state
/// to change.
///
/// Hardware tags are passed as slot numbers, the generation part of a [`Tag`](crate::Tag) never
/// reaches the hardware.
pub trait Arch: Sync {
    /// The number of processors that may ever come online. Processor ids are `0..possible_cpus()`.
    fn possible_cpus(&self) -> usize;

    /// Returns the number of tag bits the local processor implements, `0` if it has no tagged
    /// translation caches.
    ///
    /// Probing must leave the active translation state unchanged.
    fn probe_tag_bits(&self, cpu: CpuId) -> u32;

    /// Switches the local processor to the translation tables rooted at `root`, tagged with `slot`.
    ///
    /// # Safety
    ///
    /// `root` must point to a valid set of translation tables that maps the currently executing
    /// code and the caller's stack. No translation cache entries for a different address space may
    /// be tagged with `slot` on this processor.
    unsafe fn install(&self, cpu: CpuId, slot: usize, root: PhysicalAddress);

    /// Invalidates every translation cache entry on the local processor.
    fn fence_all(&self, cpu: CpuId);

    /// Invalidates every non-global entry tagged with `slot` on the local processor.
    fn fence_tag(&self, cpu: CpuId, slot: usize);

    /// Invalidates the entries for the page at `address` on the local processor, either only for
    /// `slot` or, if `None`, for every tag including global entries.
    fn fence_page(&self, cpu: CpuId, slot: Option<usize>, address: VirtualAddress);

    /// Synchronizes the local instruction cache with prior stores to instruction memory.
    fn fence_i(&self, cpu: CpuId);

    /// Runs cross calls posted to the local processor, if any.
    ///
    /// Called while the local processor spins for the allocator lock. The holder may be waiting
    /// in [`Arch::cross_call`] for this processor, which might not take interrupts while spinning.
    fn poll_cross_calls(&self, cpu: CpuId);

    /// Runs `f` on every processor in `targets` and waits for all of them to complete.
    ///
    /// If the calling processor is a target it runs `f` itself.
    fn cross_call(&self, targets: &CpuMask, f: &(dyn Fn(CpuId) + Sync));

    /// Asks the firmware to invalidate translation cache entries on the processors in `targets`
    /// (all processors if `None`). Only entries tagged with `slot` are affected, or every tag
    /// including global entries if `slot` is `None`.
    ///
    /// Returns after all targets have completed the invalidation.
    fn remote_sfence_vma(&self, targets: Option<&CpuMask>, range: FlushRange, slot: Option<usize>);

    /// Asks the firmware to synchronize the instruction caches of the processors in `targets`
    /// (all processors if `None`).
    fn remote_fence_i(&self, targets: Option<&CpuMask>);
}
