// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::vec::Vec;

use lock_api::RawMutex;

use crate::address::{PhysicalAddress, VirtualAddress};
use crate::arch::{Arch, FlushRange};
use crate::context::MmContext;
use crate::cpu_set::{CpuId, CpuMask};
use crate::manager::TagManager;

/// Something the tag manager asked the machine to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Install {
        cpu: CpuId,
        slot: usize,
        root: PhysicalAddress,
    },
    FenceAll {
        cpu: CpuId,
    },
    FenceTag {
        cpu: CpuId,
        slot: usize,
    },
    FencePage {
        cpu: CpuId,
        slot: Option<usize>,
        address: VirtualAddress,
    },
    FenceI {
        cpu: CpuId,
    },
    CrossCall {
        targets: CpuMask,
    },
    RemoteSfenceVma {
        targets: Option<CpuMask>,
        range: FlushRange,
        slot: Option<usize>,
    },
    RemoteFenceI {
        targets: Option<CpuMask>,
    },
}

/// A "virtual machine" with a number of processors, each with a tagged translation cache.
///
/// The translation cache of every processor is modeled as the set of address spaces (identified
/// by their root table) it holds entries for under each hardware slot. [`Machine::access`]
/// simulates the processor using its current translation and panics if entries of two different
/// address spaces would be visible under the same slot, the aliasing the tag manager exists to
/// prevent. Every request is also recorded as an [`Event`].
///
/// Cross calls are executed synchronously on the calling thread, so there is never anything to
/// poll. Polls are only counted.
pub struct Machine(Arc<MachineInner>);

struct MachineInner {
    cpus: Vec<Mutex<Cpu>>,
    tag_bits: Vec<u32>,
    polls: Vec<AtomicUsize>,
    events: Mutex<Vec<Event>>,
}

#[derive(Default)]
struct Cpu {
    /// The installed `(slot, root)` pair.
    satp: Option<(usize, PhysicalAddress)>,
    /// Roots with cached entries, by slot.
    tlb: BTreeMap<usize, BTreeSet<PhysicalAddress>>,
}

impl Cpu {
    fn flush_slot(&mut self, slot: usize) {
        self.tlb.remove(&slot);
    }

    fn flush_all(&mut self) {
        self.tlb.clear();
    }
}

impl Clone for Machine {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("cpus", &self.0.cpus.len())
            .field("tag_bits", &self.0.tag_bits)
            .finish_non_exhaustive()
    }
}

pub struct MachineBuilder {
    cpus: usize,
    tag_bits: u32,
    overrides: Vec<(CpuId, u32)>,
}

impl MachineBuilder {
    pub fn new() -> Self {
        Self {
            cpus: 1,
            tag_bits: 16,
            overrides: Vec::new(),
        }
    }

    pub fn with_cpus(mut self, cpus: usize) -> Self {
        self.cpus = cpus;
        self
    }

    /// The number of tag bits every processor implements, `0` for none.
    pub fn with_tag_bits(mut self, bits: u32) -> Self {
        self.tag_bits = bits;
        self
    }

    /// Overrides the number of tag bits a single processor implements.
    pub fn with_cpu_tag_bits(mut self, cpu: CpuId, bits: u32) -> Self {
        self.overrides.push((cpu, bits));
        self
    }

    pub fn finish(self) -> Machine {
        let mut tag_bits = std::vec![self.tag_bits; self.cpus];
        for (cpu, bits) in self.overrides {
            tag_bits[cpu.get()] = bits;
        }

        Machine(Arc::new(MachineInner {
            cpus: (0..self.cpus).map(|_| Mutex::default()).collect(),
            tag_bits,
            polls: (0..self.cpus).map(|_| AtomicUsize::new(0)).collect(),
            events: Mutex::new(Vec::new()),
        }))
    }
}

impl Default for MachineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    /// Simulates `cpu` executing in its current address space, filling its translation cache.
    ///
    /// # Panics
    ///
    /// Panics if nothing is installed on `cpu`, or if the cache of `cpu` holds entries of a
    /// different address space under the installed slot.
    pub fn access(&self, cpu: CpuId) {
        let mut state = self.cpu(cpu);
        let (slot, root) = state
            .satp
            .unwrap_or_else(|| panic!("cpu {cpu} has no address space installed"));

        let cached = state.tlb.entry(slot).or_default();
        if let Some(stale) = cached.iter().find(|cached| **cached != root) {
            panic!(
                "translation alias on cpu {cpu}: slot {slot} caches entries of {stale} while running {root}"
            );
        }
        cached.insert(root);
    }

    /// Switches `cpu` from `prev` to `next` and runs it.
    pub fn switch<R: RawMutex>(
        &self,
        manager: &TagManager<Machine, R>,
        prev: &MmContext,
        next: &MmContext,
        cpu: CpuId,
    ) {
        // Safety: the machine is emulated, there are no real translation tables to get wrong
        unsafe {
            manager.activate(prev, next, cpu);
        }
        self.access(cpu);
    }

    /// The `(slot, root)` pair installed on `cpu`.
    pub fn installed(&self, cpu: CpuId) -> Option<(usize, PhysicalAddress)> {
        self.cpu(cpu).satp
    }

    /// The roots `cpu` holds translation cache entries for under `slot`.
    pub fn cached_roots(&self, cpu: CpuId, slot: usize) -> Vec<PhysicalAddress> {
        self.cpu(cpu)
            .tlb
            .get(&slot)
            .map(|roots| roots.iter().copied().collect())
            .unwrap_or_default()
    }

    /// How often `cpu` checked for cross calls while waiting for a lock.
    pub fn cross_call_polls(&self, cpu: CpuId) -> usize {
        self.0.polls[cpu.get()].load(Ordering::Relaxed)
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.events.lock().unwrap().clone()
    }

    /// Returns and clears the recorded events.
    pub fn take_events(&self) -> Vec<Event> {
        std::mem::take(&mut *self.0.events.lock().unwrap())
    }

    fn cpu(&self, cpu: CpuId) -> MutexGuard<'_, Cpu> {
        self.0.cpus[cpu.get()].lock().unwrap()
    }

    fn record(&self, event: Event) {
        self.0.events.lock().unwrap().push(event);
    }

    fn each_target(&self, targets: Option<&CpuMask>, mut f: impl FnMut(&mut Cpu)) {
        let all = CpuMask::first(self.0.cpus.len());
        for cpu in targets.unwrap_or(&all) {
            f(&mut self.cpu(cpu));
        }
    }
}

impl Arch for Machine {
    fn possible_cpus(&self) -> usize {
        self.0.cpus.len()
    }

    fn probe_tag_bits(&self, cpu: CpuId) -> u32 {
        self.0.tag_bits[cpu.get()]
    }

    unsafe fn install(&self, cpu: CpuId, slot: usize, root: PhysicalAddress) {
        self.record(Event::Install { cpu, slot, root });
        self.cpu(cpu).satp = Some((slot, root));
    }

    fn fence_all(&self, cpu: CpuId) {
        self.record(Event::FenceAll { cpu });
        self.cpu(cpu).flush_all();
    }

    fn fence_tag(&self, cpu: CpuId, slot: usize) {
        self.record(Event::FenceTag { cpu, slot });
        self.cpu(cpu).flush_slot(slot);
    }

    fn fence_page(&self, cpu: CpuId, slot: Option<usize>, address: VirtualAddress) {
        // Only whole address spaces are modeled, a single page leaves the association in place.
        self.record(Event::FencePage { cpu, slot, address });
    }

    fn fence_i(&self, cpu: CpuId) {
        self.record(Event::FenceI { cpu });
    }

    fn poll_cross_calls(&self, cpu: CpuId) {
        self.0.polls[cpu.get()].fetch_add(1, Ordering::Relaxed);
    }

    fn cross_call(&self, targets: &CpuMask, f: &(dyn Fn(CpuId) + Sync)) {
        self.record(Event::CrossCall { targets: *targets });
        for cpu in targets {
            f(cpu);
        }
    }

    fn remote_sfence_vma(&self, targets: Option<&CpuMask>, range: FlushRange, slot: Option<usize>) {
        self.record(Event::RemoteSfenceVma {
            targets: targets.copied(),
            range,
            slot,
        });

        if range == FlushRange::All {
            self.each_target(targets, |cpu| match slot {
                Some(slot) => cpu.flush_slot(slot),
                None => cpu.flush_all(),
            });
        }
    }

    fn remote_fence_i(&self, targets: Option<&CpuMask>) {
        self.record(Event::RemoteFenceI {
            targets: targets.copied(),
        });
    }
}
