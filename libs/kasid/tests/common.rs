// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![allow(unused, reason = "not used by all tests")]

use std::sync::Arc;

use kasid::test_utils::{Event, Machine, MachineBuilder};
use kasid::{Config, CpuId, MmContext, PAGE_SIZE, PhysicalAddress, TagManager};

pub type Manager = TagManager<Machine, parking_lot::RawMutex>;

/// An emulated machine together with its tag manager and the address space each processor runs.
pub struct System {
    pub machine: Machine,
    pub manager: Manager,
    pub kernel: Arc<MmContext>,
    pub running: Vec<Arc<MmContext>>,
    next_root: usize,
}

impl System {
    pub fn new(cpus: usize, tag_bits: u32, config: Config) -> Self {
        let machine = MachineBuilder::new()
            .with_cpus(cpus)
            .with_tag_bits(tag_bits)
            .finish();
        Self::with_machine(machine, config)
    }

    pub fn with_machine(machine: Machine, config: Config) -> Self {
        let manager = Manager::new(machine.clone(), config, CpuId::new(0));
        let kernel = manager.new_context(PhysicalAddress::new(0x8000_0000));
        let running = vec![kernel.clone(); manager.possible_cpus()];

        Self {
            machine,
            manager,
            kernel,
            running,
            next_root: 0x9000_0000,
        }
    }

    /// Creates a new address space with a unique root.
    pub fn spawn(&mut self) -> Arc<MmContext> {
        let root = PhysicalAddress::new(self.next_root);
        self.next_root += PAGE_SIZE;
        self.manager.new_context(root)
    }

    /// Switches `cpu` to `next` and simulates running it.
    pub fn switch(&mut self, cpu: usize, next: &Arc<MmContext>) {
        let prev = self.running[cpu].clone();
        self.machine
            .switch(&self.manager, &prev, next, CpuId::new(cpu));
        self.running[cpu] = next.clone();
    }

    pub fn take_events(&self) -> Vec<Event> {
        self.machine.take_events()
    }
}

pub fn cpu(id: usize) -> CpuId {
    CpuId::new(id)
}
