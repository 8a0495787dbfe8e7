// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use lock_api::RawMutex;

use crate::address::PhysicalAddress;
use crate::allocator::{RolloverHooks, TagAllocator};
use crate::arch::Arch;
use crate::config::Config;
use crate::context::{MmContext, Registry};
#[cfg(feature = "counters")]
use crate::counters::{CounterSnapshot, Counters};
use crate::cpu_set::{CpuId, MAX_CPUS};
use crate::error::Error;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::shootdown::Shootdown;
use crate::tag::{Tag, TagLayout};

/// Owns the address space tags of the whole system.
///
/// One instance is created at boot and shared by all processors. `A` provides access to the
/// hardware, `R` is the lock protecting the allocator, which is held across rollovers and must
/// therefore not be a sleeping lock.
pub struct TagManager<A, R: RawMutex> {
    pub(crate) arch: A,
    config: Config,
    /// Starts out as `config.flush_threshold`, adjustable at runtime.
    flush_threshold: AtomicUsize,
    num_cpus: usize,
    probed_bits: u32,
    /// `None` if tagging is disabled and every address space runs untagged.
    pub(crate) allocator: Option<TagAllocator<R>>,
    registry: Registry<R>,
    pub(crate) shootdown: Shootdown,
    #[cfg(feature = "counters")]
    pub(crate) counters: Counters,
}

impl<A: Arch, R: RawMutex> TagManager<A, R> {
    /// Probes the hardware tag width on `boot_cpu` and sets up the allocator.
    ///
    /// Tagging is disabled if the processor implements no tag bits, or if there are not more
    /// usable slots than processors. In the latter case a rollover could find every slot
    /// reserved and have nothing left to hand out.
    ///
    /// # Panics
    ///
    /// Panics if the platform reports no processors or more than [`MAX_CPUS`].
    pub fn new(arch: A, config: Config, boot_cpu: CpuId) -> Self {
        let num_cpus = arch.possible_cpus();
        assert!(
            num_cpus > 0 && num_cpus <= MAX_CPUS,
            "unsupported number of processors {num_cpus}"
        );

        let probed_bits = arch.probe_tag_bits(boot_cpu);
        let bits = config
            .tag_bits
            .map_or(probed_bits, |limit| limit.min(probed_bits))
            .min(usize::BITS - 1);

        let allocator = if bits == 0 {
            log::info!("address space tags not supported, running untagged");
            None
        } else {
            let layout = TagLayout::new(bits, config.generation_bits);
            if layout.slot_space() - 1 <= num_cpus {
                log::warn!(
                    "{} address space tags are too few for {num_cpus} processors, running untagged",
                    layout.slot_space()
                );
                None
            } else {
                log::info!(
                    "using {bits} bit address space tags ({} slots, {} generation bits)",
                    layout.slot_space(),
                    layout.generation_bits()
                );
                Some(TagAllocator::new(layout, num_cpus))
            }
        };

        Self {
            shootdown: Shootdown::new(&config, num_cpus),
            flush_threshold: AtomicUsize::new(config.flush_threshold),
            arch,
            config,
            num_cpus,
            probed_bits,
            allocator,
            registry: Registry::new(),
            #[cfg(feature = "counters")]
            counters: Counters::new(),
        }
    }

    /// Checks that a secondary processor coming online implements the same tag width as the boot
    /// processor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TagWidthMismatch`] if tagging is enabled and the widths differ. The
    /// processor must not be brought online in that case.
    pub fn verify_cpu(&self, cpu: CpuId) -> crate::Result<()> {
        if self.allocator.is_none() {
            return Ok(());
        }

        let found = self.arch.probe_tag_bits(cpu);
        if found != self.probed_bits {
            log::error!(
                "cpu {cpu} implements {found} address space tag bits, boot cpu {}",
                self.probed_bits
            );
            return Err(Error::TagWidthMismatch {
                cpu,
                expected: self.probed_bits,
                found,
            });
        }

        Ok(())
    }

    /// Creates the state for a new address space with root translation table `root`.
    pub fn new_context(&self, root: PhysicalAddress) -> Arc<MmContext> {
        let ctx = Arc::new(MmContext::new(root));
        self.registry.register(&ctx);
        ctx
    }

    /// Releases `ctx`. It must not be running on any processor.
    ///
    /// The tag is not returned to the allocator, its slot becomes free at the next rollover.
    pub fn on_address_space_destroyed(&self, ctx: &MmContext) {
        debug_assert!(
            ctx.residency.load().is_empty(),
            "address space destroyed while still running"
        );

        self.registry.unregister(ctx);
        ctx.cache_membership.clear();
        ctx.icache_stale.clear();
    }

    /// Whether address spaces are tagged.
    pub fn is_enabled(&self) -> bool {
        self.allocator.is_some()
    }

    /// The tag layout, `None` if tagging is disabled.
    pub fn layout(&self) -> Option<TagLayout> {
        self.allocator.as_ref().map(TagAllocator::layout)
    }

    /// The current generation, `None` if tagging is disabled.
    pub fn generation(&self) -> Option<usize> {
        self.allocator
            .as_ref()
            .map(|allocator| allocator.table().generation())
    }

    /// The tag `cpu` is running with, [`Tag::NONE`] if tagging is disabled or the processor has
    /// not switched address spaces since the last rollover.
    pub fn active_tag(&self, cpu: CpuId) -> Tag {
        self.allocator
            .as_ref()
            .map_or(Tag::NONE, |allocator| allocator.table().get(cpu))
    }

    /// The tags reserved at the last rollover, indexed by processor.
    pub fn reserved_tags(&self) -> Vec<Tag> {
        self.allocator
            .as_ref()
            .map(|allocator| allocator.lock().reserved().to_vec())
            .unwrap_or_default()
    }

    /// The number of pages above which ranged invalidations are widened to full flushes.
    pub fn flush_threshold(&self) -> usize {
        self.flush_threshold.load(Ordering::Relaxed)
    }

    /// Changes the widening threshold for subsequent invalidations.
    pub fn set_flush_threshold(&self, pages: usize) {
        log::debug!("translation cache flush threshold set to {pages} pages");
        self.flush_threshold.store(pages, Ordering::Relaxed);
    }

    /// The configuration the manager was created with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn arch(&self) -> &A {
        &self.arch
    }

    pub fn possible_cpus(&self) -> usize {
        self.num_cpus
    }

    /// The number of registered address spaces that are still alive.
    pub fn live_contexts(&self) -> usize {
        self.registry.len()
    }

    #[cfg(feature = "counters")]
    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }
}

impl<A: Arch, R: RawMutex> RolloverHooks for TagManager<A, R> {
    fn for_each_context(&self, f: &mut dyn FnMut(&MmContext)) {
        self.registry.for_each(f);
    }

    fn on_rollover(&self, overflowed: bool) {
        #[cfg(feature = "counters")]
        {
            Counters::bump(&self.counters.rollovers);
            if overflowed {
                Counters::bump(&self.counters.epoch_overflows);
            }
        }
        #[cfg(not(feature = "counters"))]
        let _ = overflowed;

        self.flush_all();
    }
}

impl<A: fmt::Debug, R: RawMutex> fmt::Debug for TagManager<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagManager")
            .field("arch", &self.arch)
            .field("config", &self.config)
            .field("probed_bits", &self.probed_bits)
            .field("layout", &self.allocator.as_ref().map(TagAllocator::layout))
            .field(
                "generation",
                &self
                    .allocator
                    .as_ref()
                    .map(|allocator| allocator.table().generation()),
            )
            .finish_non_exhaustive()
    }
}
