// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::boxed::Box;
use alloc::vec;

use lock_api::{Mutex, MutexGuard, RawMutex};

use crate::bitmap::SlotBitmap;
use crate::context::MmContext;
use crate::cpu_set::CpuId;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::tag::{OverflowPolicy, Tag, TagLayout};

/// Work a rollover needs from the rest of the system.
pub(crate) trait RolloverHooks {
    /// Calls `f` for every live address space.
    fn for_each_context(&self, f: &mut dyn FnMut(&MmContext));

    /// Called once the new generation is set up, while the allocator lock is still held.
    ///
    /// Must invalidate every translation cache entry on every processor before returning.
    fn on_rollover(&self, overflowed: bool);
}

/// The lock-free half of the allocator: the current generation and the tag each processor is
/// running with.
///
/// The context switch fast path and rollover race on the `active` slots. Both only ever modify
/// them with read-modify-write operations, so exactly one of them wins: either the fast path
/// installs its tag before rollover retires it (and the tag is carried over as reserved), or
/// rollover zeroes the slot first and the fast path fails its compare-and-swap.
pub(crate) struct ActiveTable {
    layout: TagLayout,
    generation: AtomicUsize,
    active: Box<[AtomicUsize]>,
}

impl ActiveTable {
    pub fn new(layout: TagLayout, num_cpus: usize) -> Self {
        Self {
            layout,
            generation: AtomicUsize::new(layout.first_generation()),
            active: (0..num_cpus).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    pub fn generation(&self) -> usize {
        self.generation.load(Ordering::Relaxed)
    }

    pub fn is_current(&self, tag: Tag) -> bool {
        self.layout.generation(tag) == self.generation()
    }

    pub fn get(&self, cpu: CpuId) -> Tag {
        Tag::from_raw(self.active[cpu.get()].load(Ordering::Relaxed))
    }

    pub fn set(&self, cpu: CpuId, tag: Tag) {
        self.active[cpu.get()].store(tag.get(), Ordering::Relaxed);
    }

    /// Tries to mark `tag` as active on `cpu` without taking the allocator lock.
    ///
    /// Fails if `tag` is of a past generation or a rollover has retired this processor's active
    /// tag since it was last set.
    pub fn try_fast_path(&self, cpu: CpuId, tag: Tag) -> bool {
        let slot = &self.active[cpu.get()];

        let old_active = slot.load(Ordering::Relaxed);
        old_active != 0
            && self.is_current(tag)
            && slot
                .compare_exchange(old_active, tag.get(), Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
    }

    /// Retires the active tag of `cpu`, returning it. Returns [`Tag::NONE`] if the processor has
    /// not activated a new tag since the last rollover.
    pub fn retire(&self, cpu: CpuId) -> Tag {
        Tag::from_raw(self.active[cpu.get()].swap(0, Ordering::Relaxed))
    }

    pub fn advance(&self, generation: usize) {
        self.generation.store(generation, Ordering::Relaxed);
    }

    pub fn num_cpus(&self) -> usize {
        self.active.len()
    }
}

/// State protected by the allocator lock.
pub(crate) struct AllocatorState {
    bitmap: SlotBitmap,
    /// Where the search for a free slot starts.
    cursor: usize,
    /// Per processor, the tag that was active at the last rollover and must survive it.
    reserved: Box<[Tag]>,
}

impl AllocatorState {
    /// Replaces every reserved entry equal to `old` with `new`.
    ///
    /// Several processors can hold the same reserved tag, so all entries are checked.
    fn update_reserved(&mut self, old: Tag, new: Tag) -> bool {
        let mut hit = false;
        for reserved in &mut self.reserved {
            if *reserved == old {
                *reserved = new;
                hit = true;
            }
        }
        hit
    }

    fn claim(&mut self, layout: TagLayout, generation: usize, slot: usize) -> Tag {
        self.bitmap.set(slot);
        self.cursor = slot;
        layout.compose(generation, slot)
    }

    pub fn reserved(&self) -> &[Tag] {
        &self.reserved
    }
}

/// Hands out tags and rolls over to a new generation when the slots run out.
pub(crate) struct TagAllocator<R: RawMutex> {
    table: ActiveTable,
    state: Mutex<R, AllocatorState>,
}

impl<R: RawMutex> TagAllocator<R> {
    pub fn new(layout: TagLayout, num_cpus: usize) -> Self {
        Self {
            table: ActiveTable::new(layout, num_cpus),
            state: Mutex::new(AllocatorState {
                bitmap: SlotBitmap::new(layout.slot_space()),
                cursor: 1,
                reserved: vec![Tag::NONE; num_cpus].into_boxed_slice(),
            }),
        }
    }

    pub fn layout(&self) -> TagLayout {
        self.table.layout
    }

    pub fn table(&self) -> &ActiveTable {
        &self.table
    }

    pub fn lock(&self) -> MutexGuard<'_, R, AllocatorState> {
        self.state.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, R, AllocatorState>> {
        self.state.try_lock()
    }

    /// Returns a tag of the current generation for an address space that currently holds
    /// `current`.
    ///
    /// If `current` is still reserved by some processor it is carried over into the current
    /// generation with the same slot. Otherwise the next free slot is claimed, rolling over to a
    /// new generation if there is none.
    ///
    /// # Panics
    ///
    /// Panics if no slot is free even after a rollover, or if the generation counter overflows
    /// on a layout that does not support resetting it.
    pub fn allocate(
        &self,
        state: &mut AllocatorState,
        current: Tag,
        hooks: &impl RolloverHooks,
    ) -> Tag {
        let layout = self.table.layout;
        let generation = self.table.generation();

        if !current.is_none() {
            let candidate = layout.compose(generation, layout.slot(current));
            if state.update_reserved(current, candidate) {
                log::trace!("carrying over reserved tag {current} as {candidate}");
                return candidate;
            }
        }

        if let Some(slot) = state.bitmap.find_next_zero(state.cursor) {
            return state.claim(layout, generation, slot);
        }

        self.rollover(state, hooks);

        let generation = self.table.generation();
        let slot = state.bitmap.find_next_zero(1).unwrap_or_else(|| {
            panic!("no free address space tag after rollover to generation {generation:#x}")
        });
        state.claim(layout, generation, slot)
    }

    fn rollover(&self, state: &mut AllocatorState, hooks: &impl RolloverHooks) {
        let layout = self.table.layout;
        let old = self.table.generation();

        let (generation, overflowed) = match layout.next_generation(old) {
            Some(next) => (next, false),
            None => match layout.overflow_policy() {
                OverflowPolicy::Reset => (layout.first_generation(), true),
                OverflowPolicy::Fatal => {
                    panic!("address space tag generation counter overflowed at {old:#x}")
                }
            },
        };
        self.table.advance(generation);

        state.bitmap.clear_all();
        for cpu in 0..self.table.num_cpus() {
            let mut tag = self.table.retire(CpuId::new(cpu));
            // A processor that has not switched address spaces since the last rollover keeps the
            // tag it was running with back then.
            if tag.is_none() {
                tag = state.reserved[cpu];
            }
            state.bitmap.set(layout.slot(tag));
            state.reserved[cpu] = tag;
        }

        if overflowed {
            self.sweep(state, hooks);
        }

        log::debug!(
            "rolled over to tag generation {generation:#x}, {} slots reserved",
            state.bitmap.count_ones()
        );

        hooks.on_rollover(overflowed);
    }

    /// Migrates every live address space after the generation counter wrapped around.
    ///
    /// Tags still reserved by some processor move to the first generation with the same slot,
    /// every other tag is cleared. Without this an address space idle since the first generation
    /// would look current again.
    fn sweep(&self, state: &mut AllocatorState, hooks: &impl RolloverHooks) {
        let layout = self.table.layout;
        let first = layout.first_generation();

        log::info!("address space tag generation counter wrapped, resetting live address spaces");

        hooks.for_each_context(&mut |ctx| {
            let tag = ctx.tag();
            if tag.is_none() {
                return;
            }

            let migrated = layout.compose(first, layout.slot(tag));
            if state.update_reserved(tag, migrated) {
                ctx.set_tag(migrated);
            } else {
                ctx.set_tag(Tag::NONE);
            }
        });
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::cell::{Cell, RefCell};

    use super::*;
    use crate::address::PhysicalAddress;

    type TagAllocator = super::TagAllocator<parking_lot::RawMutex>;

    #[derive(Default)]
    struct Recorder {
        contexts: Vec<Arc<MmContext>>,
        rollovers: RefCell<Vec<bool>>,
        swept: Cell<usize>,
    }

    impl RolloverHooks for Recorder {
        fn for_each_context(&self, f: &mut dyn FnMut(&MmContext)) {
            self.swept.set(self.swept.get() + 1);
            for ctx in &self.contexts {
                f(ctx);
            }
        }

        fn on_rollover(&self, overflowed: bool) {
            self.rollovers.borrow_mut().push(overflowed);
        }
    }

    fn alloc_on(allocator: &TagAllocator, hooks: &Recorder, cpu: usize, current: Tag) -> Tag {
        let mut state = allocator.lock();
        let tag = allocator.allocate(&mut state, current, hooks);
        allocator.table().set(CpuId::new(cpu), tag);
        tag
    }

    #[test]
    fn allocates_sequential_slots() {
        let layout = TagLayout::new(4, None);
        let allocator = TagAllocator::new(layout, 2);
        let hooks = Recorder::default();

        let a = alloc_on(&allocator, &hooks, 0, Tag::NONE);
        let b = alloc_on(&allocator, &hooks, 1, Tag::NONE);

        assert_eq!(layout.slot(a), 1);
        assert_eq!(layout.slot(b), 2);
        assert_eq!(layout.generation(a), layout.first_generation());
        assert!(hooks.rollovers.borrow().is_empty());
    }

    #[test]
    fn rollover_keeps_active_tags_reserved() {
        let layout = TagLayout::new(2, None);
        let allocator = TagAllocator::new(layout, 2);
        let hooks = Recorder::default();

        let first = layout.first_generation();
        let _a = alloc_on(&allocator, &hooks, 0, Tag::NONE);
        let b = alloc_on(&allocator, &hooks, 1, Tag::NONE);
        let c = alloc_on(&allocator, &hooks, 0, Tag::NONE);
        assert_eq!(layout.slot(c), 3);

        let d = alloc_on(&allocator, &hooks, 1, Tag::NONE);

        assert_eq!(*hooks.rollovers.borrow(), [false]);
        assert_eq!(allocator.table().generation(), first + layout.slot_space());
        assert_eq!(allocator.lock().reserved(), [c, b]);
        assert_eq!(layout.slot(d), 1);
        assert!(allocator.table().is_current(d));
    }

    #[test]
    fn reserved_tag_is_carried_over() {
        let layout = TagLayout::new(2, None);
        let allocator = TagAllocator::new(layout, 2);
        let hooks = Recorder::default();

        let a = alloc_on(&allocator, &hooks, 0, Tag::NONE);
        let _b = alloc_on(&allocator, &hooks, 1, Tag::NONE);
        let _c = alloc_on(&allocator, &hooks, 1, Tag::NONE);
        // forces a rollover, cpu 0 was still running `a`
        let _d = alloc_on(&allocator, &hooks, 1, Tag::NONE);

        let generation = allocator.table().generation();
        let carried = alloc_on(&allocator, &hooks, 0, a);

        assert_eq!(carried, layout.compose(generation, layout.slot(a)));
        assert_eq!(allocator.lock().reserved()[0], carried);
        assert_eq!(hooks.rollovers.borrow().len(), 1);
    }

    #[test]
    fn idle_cpu_keeps_previous_reservation() {
        let layout = TagLayout::new(2, None);
        let allocator = TagAllocator::new(layout, 2);
        let hooks = Recorder::default();

        let a = alloc_on(&allocator, &hooks, 0, Tag::NONE);
        // cpu 1 churns through tags, cpu 0 never switches again
        let mut current = Tag::NONE;
        for _ in 0..8 {
            current = alloc_on(&allocator, &hooks, 1, Tag::NONE);
        }

        assert!(hooks.rollovers.borrow().len() >= 2);
        assert_eq!(allocator.lock().reserved()[0], a);
        assert_ne!(layout.slot(current), layout.slot(a));
    }

    #[test]
    fn generation_reset_sweeps_contexts() {
        let layout = TagLayout::new(2, Some(1));
        let allocator = TagAllocator::new(layout, 2);

        let running = Arc::new(MmContext::new(PhysicalAddress::new(0x1000)));
        let idle = Arc::new(MmContext::new(PhysicalAddress::new(0x2000)));
        let hooks = Recorder {
            contexts: vec![running.clone(), idle.clone()],
            ..Recorder::default()
        };

        let tag = alloc_on(&allocator, &hooks, 0, Tag::NONE);
        running.set_tag(tag);
        let tag = alloc_on(&allocator, &hooks, 1, Tag::NONE);
        idle.set_tag(tag);
        // cpu 1 moves on, `idle` is no longer running anywhere
        let _ = alloc_on(&allocator, &hooks, 1, Tag::NONE);

        // a one bit generation counter wraps on the first rollover
        let _ = alloc_on(&allocator, &hooks, 1, Tag::NONE);

        assert_eq!(*hooks.rollovers.borrow(), [true]);
        assert_eq!(hooks.swept.get(), 1);
        assert_eq!(allocator.table().generation(), layout.first_generation());
        assert_eq!(
            running.tag(),
            layout.compose(layout.first_generation(), 1)
        );
        assert!(idle.tag().is_none());
    }

    #[test]
    #[should_panic(expected = "generation counter overflowed")]
    fn wide_generation_overflow_is_fatal() {
        let layout = TagLayout::new(4, Some(40));
        let allocator = TagAllocator::new(layout, 1);
        let hooks = Recorder::default();

        // the last generation a 40 bit counter can represent
        allocator.table().advance(((1 << 40) - 1) << 4);
        let mut state = allocator.lock();
        state.cursor = layout.slot_space();
        let _ = allocator.allocate(&mut state, Tag::NONE, &hooks);
    }

    #[test]
    fn fast_path_requires_current_generation() {
        let layout = TagLayout::new(4, None);
        let table = ActiveTable::new(layout, 1);
        let cpu = CpuId::new(0);
        let current = layout.compose(layout.first_generation(), 3);
        let stale = layout.compose(layout.first_generation() + layout.slot_space(), 3);

        // nothing active yet
        assert!(!table.try_fast_path(cpu, current));

        table.set(cpu, layout.compose(layout.first_generation(), 1));
        assert!(!table.try_fast_path(cpu, stale));
        assert!(table.try_fast_path(cpu, current));
        assert_eq!(table.get(cpu), current);

        assert_eq!(table.retire(cpu), current);
        assert!(!table.try_fast_path(cpu, current));
    }
}
