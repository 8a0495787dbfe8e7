// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;

use lock_api::{Mutex, RawMutex};

use crate::address::PhysicalAddress;
use crate::cpu_set::{AtomicCpuSet, CpuMask};
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::tag::Tag;

/// The per-address-space state the tag manager needs.
///
/// Created through [`TagManager::new_context`](crate::TagManager::new_context), which also
/// registers the context so that generation resets can reach it.
pub struct MmContext {
    tag: AtomicUsize,
    root: PhysicalAddress,
    /// Processors currently running this address space.
    pub(crate) residency: AtomicCpuSet,
    /// Processors that may hold translation cache entries for this address space.
    /// Always a superset of `residency`.
    pub(crate) cache_membership: AtomicCpuSet,
    /// Processors that must synchronize their instruction cache before running this address space
    /// again.
    pub(crate) icache_stale: AtomicCpuSet,
}

impl MmContext {
    pub(crate) fn new(root: PhysicalAddress) -> Self {
        Self {
            tag: AtomicUsize::new(Tag::NONE.get()),
            root,
            residency: AtomicCpuSet::new(),
            cache_membership: AtomicCpuSet::new(),
            icache_stale: AtomicCpuSet::new(),
        }
    }

    /// The tag last assigned to this address space. May be of a past generation.
    pub fn tag(&self) -> Tag {
        Tag::from_raw(self.tag.load(Ordering::Relaxed))
    }

    pub(crate) fn set_tag(&self, tag: Tag) {
        self.tag.store(tag.get(), Ordering::Relaxed);
    }

    /// Physical address of the root translation table.
    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    pub fn residency(&self) -> CpuMask {
        self.residency.load()
    }

    pub fn cache_membership(&self) -> CpuMask {
        self.cache_membership.load()
    }

    pub fn icache_stale(&self) -> CpuMask {
        self.icache_stale.load()
    }
}

impl fmt::Debug for MmContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmContext")
            .field("tag", &self.tag())
            .field("root", &self.root)
            .field("residency", &self.residency)
            .field("cache_membership", &self.cache_membership)
            .field("icache_stale", &self.icache_stale)
            .finish()
    }
}

/// All live address spaces, visited when the generation counter wraps around.
///
/// Holds weak references only, an address space is kept alive by its owner.
pub(crate) struct Registry<R: RawMutex> {
    contexts: Mutex<R, Vec<Weak<MmContext>>>,
}

impl<R: RawMutex> Registry<R> {
    pub fn new() -> Self {
        Self {
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, ctx: &Arc<MmContext>) {
        let mut contexts = self.contexts.lock();
        // piggyback pruning of dropped contexts onto registration
        contexts.retain(|weak| weak.strong_count() > 0);
        contexts.push(Arc::downgrade(ctx));
    }

    pub fn unregister(&self, ctx: &MmContext) {
        self.contexts
            .lock()
            .retain(|weak| weak.strong_count() > 0 && !core::ptr::eq(weak.as_ptr(), ctx));
    }

    /// Calls `f` for every live address space.
    pub fn for_each(&self, mut f: impl FnMut(&MmContext)) {
        let contexts = self.contexts.lock();
        for ctx in contexts.iter().filter_map(Weak::upgrade) {
            f(&ctx);
        }
    }

    pub fn len(&self) -> usize {
        self.contexts
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    type Registry = super::Registry<parking_lot::RawMutex>;

    #[test]
    fn visits_live_contexts_only() {
        let registry = Registry::new();
        let a = Arc::new(MmContext::new(PhysicalAddress::new(0x1000)));
        let b = Arc::new(MmContext::new(PhysicalAddress::new(0x2000)));
        registry.register(&a);
        registry.register(&b);
        drop(b);

        let mut roots = Vec::new();
        registry.for_each(|ctx| roots.push(ctx.root()));

        assert_eq!(roots, [PhysicalAddress::new(0x1000)]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unregister_removes_context() {
        let registry = Registry::new();
        let a = Arc::new(MmContext::new(PhysicalAddress::new(0x1000)));
        let b = Arc::new(MmContext::new(PhysicalAddress::new(0x2000)));
        registry.register(&a);
        registry.register(&b);

        registry.unregister(&a);

        let mut roots = Vec::new();
        registry.for_each(|ctx| roots.push(ctx.root()));
        assert_eq!(roots, [PhysicalAddress::new(0x2000)]);
    }

    #[test]
    fn new_context_is_untagged() {
        let ctx = MmContext::new(PhysicalAddress::new(0x3000));

        assert!(ctx.tag().is_none());
        assert!(ctx.residency().is_empty());
        assert!(ctx.cache_membership().is_empty());
        assert!(ctx.icache_stale().is_empty());
    }
}
