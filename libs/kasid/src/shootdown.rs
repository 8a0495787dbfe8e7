// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Translation cache invalidation across processors.
//!
//! Invalidations for an address space are only sent to the processors in its cache membership
//! set, the processors that may hold entries for it. Ranged invalidations that span more than the
//! configured threshold of pages are widened to invalidate the whole address space instead.

use lock_api::RawMutex;

use crate::address::{self, PAGE_SIZE, VirtualAddress};
use crate::arch::{Arch, FlushRange};
use crate::config::{Config, Delivery};
use crate::context::MmContext;
#[cfg(feature = "counters")]
use crate::counters::Counters;
use crate::cpu_set::{CpuId, CpuMask};
use crate::manager::TagManager;

/// Which entries an invalidation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FlushRequest {
    /// The hardware tag, `None` for every tag including global entries.
    pub slot: Option<usize>,
    pub range: FlushRange,
}

/// A mechanism for delivering invalidations to other processors.
pub(crate) trait Strategy {
    /// Invalidates translation cache entries on `targets`, all processors if `None`.
    fn flush_tlb<A: Arch>(&self, arch: &A, targets: Option<&CpuMask>, request: FlushRequest);

    /// Synchronizes the instruction caches of `targets`, all processors if `None`.
    fn flush_icache<A: Arch>(&self, arch: &A, targets: Option<&CpuMask>);
}

/// Interrupts each target and has it invalidate its own translation cache.
pub(crate) struct IpiBroadcast {
    num_cpus: usize,
}

impl IpiBroadcast {
    fn local_flush<A: Arch>(arch: &A, cpu: CpuId, request: FlushRequest) {
        match (request.range, request.slot) {
            (FlushRange::All, Some(slot)) => arch.fence_tag(cpu, slot),
            (FlushRange::All, None) => arch.fence_all(cpu),
            (FlushRange::Range { start, len }, slot) => {
                for page in address::pages(start, len) {
                    arch.fence_page(cpu, slot, page);
                }
            }
        }
    }
}

impl Strategy for IpiBroadcast {
    fn flush_tlb<A: Arch>(&self, arch: &A, targets: Option<&CpuMask>, request: FlushRequest) {
        let all = CpuMask::first(self.num_cpus);
        let targets = targets.unwrap_or(&all);

        arch.cross_call(targets, &|cpu| Self::local_flush(arch, cpu, request));
    }

    fn flush_icache<A: Arch>(&self, arch: &A, targets: Option<&CpuMask>) {
        let all = CpuMask::first(self.num_cpus);
        let targets = targets.unwrap_or(&all);

        arch.cross_call(targets, &|cpu| arch.fence_i(cpu));
    }
}

/// Hands the invalidation to the firmware in a single call.
pub(crate) struct FirmwareBroadcast;

impl Strategy for FirmwareBroadcast {
    fn flush_tlb<A: Arch>(&self, arch: &A, targets: Option<&CpuMask>, request: FlushRequest) {
        arch.remote_sfence_vma(targets, request.range, request.slot);
    }

    fn flush_icache<A: Arch>(&self, arch: &A, targets: Option<&CpuMask>) {
        arch.remote_fence_i(targets);
    }
}

/// The delivery mechanism chosen at boot.
pub(crate) enum Shootdown {
    Ipi(IpiBroadcast),
    Firmware(FirmwareBroadcast),
}

impl Shootdown {
    pub fn new(config: &Config, num_cpus: usize) -> Self {
        match config.delivery {
            Delivery::Ipi => Self::Ipi(IpiBroadcast { num_cpus }),
            Delivery::Firmware => Self::Firmware(FirmwareBroadcast),
        }
    }
}

impl Strategy for Shootdown {
    fn flush_tlb<A: Arch>(&self, arch: &A, targets: Option<&CpuMask>, request: FlushRequest) {
        match self {
            Shootdown::Ipi(ipi) => ipi.flush_tlb(arch, targets, request),
            Shootdown::Firmware(firmware) => firmware.flush_tlb(arch, targets, request),
        }
    }

    fn flush_icache<A: Arch>(&self, arch: &A, targets: Option<&CpuMask>) {
        match self {
            Shootdown::Ipi(ipi) => ipi.flush_icache(arch, targets),
            Shootdown::Firmware(firmware) => firmware.flush_icache(arch, targets),
        }
    }
}

impl<A: Arch, R: RawMutex> TagManager<A, R> {
    /// Invalidates every translation cache entry on every processor.
    pub fn flush_all(&self) {
        log::trace!("flushing all translation caches");

        #[cfg(feature = "counters")]
        Counters::bump(&self.counters.full_flushes);

        self.shootdown.flush_tlb(
            &self.arch,
            None,
            FlushRequest {
                slot: None,
                range: FlushRange::All,
            },
        );
    }

    /// Invalidates every entry of `mm` on the processors that may cache it.
    pub fn invalidate_all(&self, mm: &MmContext) {
        self.flush_mm(mm, FlushRange::All);
    }

    /// Invalidates the entries of `mm` for the pages touched by `start..start + len`.
    pub fn invalidate_range(&self, mm: &MmContext, start: VirtualAddress, len: usize) {
        if len == 0 {
            return;
        }

        let range = self.widen(start, len);
        self.flush_mm(mm, range);
    }

    /// Invalidates the entries of `mm` for the page containing `address`.
    pub fn invalidate_page(&self, mm: &MmContext, address: VirtualAddress) {
        self.invalidate_range(mm, address.align_down(PAGE_SIZE), PAGE_SIZE);
    }

    /// Invalidates kernel mappings for the pages touched by `start..start + len` on every
    /// processor, regardless of tag.
    pub fn invalidate_kernel_range(&self, start: VirtualAddress, len: usize) {
        if len == 0 {
            return;
        }

        let range = self.widen(start, len);
        log::trace!("invalidating kernel range {range:?}");
        self.count_flush(range);

        self.shootdown
            .flush_tlb(&self.arch, None, FlushRequest { slot: None, range });
    }

    fn flush_mm(&self, mm: &MmContext, range: FlushRange) {
        let targets = mm.cache_membership.load();
        if targets.is_empty() {
            return;
        }

        let slot = self
            .allocator
            .as_ref()
            .map_or(0, |allocator| allocator.layout().slot(mm.tag()));

        log::trace!("invalidating {range:?} of tag slot {slot} on {targets:?}");
        self.count_flush(range);

        self.shootdown.flush_tlb(
            &self.arch,
            Some(&targets),
            FlushRequest {
                slot: Some(slot),
                range,
            },
        );
    }

    fn widen(&self, start: VirtualAddress, len: usize) -> FlushRange {
        if address::page_count(start, len) > self.flush_threshold() {
            FlushRange::All
        } else {
            FlushRange::Range { start, len }
        }
    }

    #[cfg_attr(
        not(feature = "counters"),
        expect(unused_variables, reason = "only used for counting")
    )]
    fn count_flush(&self, range: FlushRange) {
        #[cfg(feature = "counters")]
        match range {
            FlushRange::All => Counters::bump(&self.counters.full_flushes),
            FlushRange::Range { .. } => Counters::bump(&self.counters.range_flushes),
        }
    }
}
