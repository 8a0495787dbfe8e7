// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![cfg_attr(not(any(test, feature = "test_utils")), no_std)]

//! Address space identifier allocation and TLB shootdown for multi-hart systems.
//!
//! Every address space that runs on more than one hart needs a short hardware tag (the ASID on
//! RISC-V) so the translation caches can tell entries of different address spaces apart without
//! a full flush on every context switch. Tags are a scarce, hardware-bounded resource shared by
//! all harts. This crate hands them out, recycles them in *generations* and coordinates the
//! translation- and instruction-cache invalidations that keep reuse safe.
//!
//! ## Tags and generations
//!
//! A [`Tag`] packs a generation counter into the high bits and the hardware slot into the low
//! bits. Slot `0` is never handed out, it means "no tag assigned yet". A tag is only valid while
//! its generation matches the global one. When all slots of a generation are used up the
//! allocator *rolls over*: it bumps the generation (invalidating every tag at once), rebuilds the
//! slot bitmap from the tags that are still installed on some hart and flushes every
//! translation cache in the system.
//!
//! ## Context switches
//!
//! [`TagManager::activate`] is the per-hart hot path. If the incoming address space already holds
//! a tag of the current generation it is installed with a single compare-and-swap and no locks.
//! Otherwise the global allocator lock is taken and a fresh tag is allocated, possibly rolling
//! over.
//!
//! ## Hardware
//!
//! All interaction with the hardware and the firmware goes through the [`Arch`] trait. The
//! `arch::riscv64` backend drives `satp`, `sfence.vma` and the SBI RFENCE extension, while
//! `test_utils::Machine` (behind the `test_utils` feature) emulates a multi-hart machine that
//! checks every translation for aliasing.

extern crate alloc;

mod activate;
mod address;
mod allocator;
pub mod arch;
mod bitmap;
mod config;
mod context;
#[cfg(feature = "counters")]
mod counters;
mod cpu_set;
mod error;
mod icache;
mod loom;
mod manager;
mod shootdown;
mod tag;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use address::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
pub use arch::{Arch, FlushRange};
pub use config::{Config, Delivery};
pub use context::MmContext;
#[cfg(feature = "counters")]
pub use counters::CounterSnapshot;
pub use cpu_set::{CpuId, CpuMask, MAX_CPUS};
pub use error::Error;
pub use manager::TagManager;
pub use tag::{OverflowPolicy, Tag, TagLayout};

pub type Result<T> = core::result::Result<T, Error>;
