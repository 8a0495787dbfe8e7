// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod sbi;

use alloc::boxed::Box;
use core::arch::asm;
use core::ptr;

use lock_api::{Mutex, RawMutex};

use crate::address::{PhysicalAddress, VirtualAddress};
use crate::arch::satp::{Mode, Satp};
use crate::arch::{Arch, FlushRange};
use crate::cpu_set::{CpuId, CpuMask};
use crate::loom::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

const BITS_PER_WORD: usize = size_of::<usize>() * 8;
/// Supervisor software interrupt pending bit in `sip`.
const SIP_SSIP: usize = 1 << 1;

/// A function posted to other harts by [`Riscv64::cross_call`].
struct CrossCall<'a> {
    f: &'a (dyn Fn(CpuId) + Sync),
    pending: AtomicUsize,
}

/// RISC-V backend: `satp` for installing address spaces, `sfence.vma` and `fence.i` for local
/// invalidation, and the SBI for everything that crosses hart boundaries.
///
/// Processor ids are hart ids. The kernel must call [`Riscv64::handle_ipi`] from its supervisor
/// software interrupt handler for cross calls to complete.
pub struct Riscv64<R: RawMutex> {
    mode: Mode,
    harts: usize,
    current_hart: fn() -> CpuId,
    /// Per hart, the cross call it has yet to run.
    mailboxes: Box<[AtomicPtr<()>]>,
    /// Serializes cross calls, there is only one mailbox slot per hart.
    cross_call_lock: Mutex<R, ()>,
}

impl<R: RawMutex> Riscv64<R> {
    /// Creates the backend for a system with `harts` harts translating with `mode`.
    ///
    /// `current_hart` returns the id of the calling hart.
    pub fn new(mode: Mode, harts: usize, current_hart: fn() -> CpuId) -> Self {
        Self {
            mode,
            harts,
            current_hart,
            mailboxes: (0..harts).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
            cross_call_lock: Mutex::new(()),
        }
    }

    /// Runs the cross call posted to the calling hart, if any.
    ///
    /// Must be called from the supervisor software interrupt handler.
    pub fn handle_ipi(&self) {
        // Safety: clearing our own pending software interrupt
        unsafe {
            asm!("csrc sip, {}", in(reg) SIP_SSIP);
        }

        self.poll_mailbox((self.current_hart)());
    }

    fn poll_mailbox(&self, hart: CpuId) {
        let call = self.mailboxes[hart.get()].swap(ptr::null_mut(), Ordering::Acquire);
        if call.is_null() {
            return;
        }

        // Safety: the poster spins until `pending` drops to zero, so the call outlives this
        // reference. It must not be touched after the decrement.
        let call = unsafe { &*call.cast_const().cast::<CrossCall<'_>>() };
        (call.f)(hart);
        call.pending.fetch_sub(1, Ordering::Release);
    }

    fn read_satp() -> Satp {
        let bits: usize;
        // Safety: reading a CSR has no side effects
        unsafe {
            asm!("csrr {}, satp", out(reg) bits);
        }
        Satp::from_bits(bits)
    }

    /// # Safety
    ///
    /// See [`Arch::install`].
    unsafe fn write_satp(satp: Satp) {
        // Safety: ensured by caller
        unsafe {
            asm!("csrw satp, {}", in(reg) satp.bits());
        }
    }
}

/// Calls `f` with each non-empty `(hart_mask, hart_mask_base)` pair covering `targets`, or once
/// with the all-harts encoding if `targets` is `None`.
fn for_each_hart_mask(targets: Option<&CpuMask>, mut f: impl FnMut(usize, usize)) {
    let Some(targets) = targets else {
        f(0, sbi::ALL_HARTS);
        return;
    };

    for (index, word) in targets.words().iter().enumerate() {
        if *word != 0 {
            f(*word, index * BITS_PER_WORD);
        }
    }
}

impl<R: RawMutex + Sync> Arch for Riscv64<R> {
    fn possible_cpus(&self) -> usize {
        self.harts
    }

    fn probe_tag_bits(&self, cpu: CpuId) -> u32 {
        debug_assert_eq!(cpu, (self.current_hart)());

        let old = Self::read_satp();
        // Safety: the ASID field is WARL and the root stays the same, so translation is unaffected
        let probed = unsafe {
            Self::write_satp(old.with_all_asid_bits());
            let probed = Self::read_satp();
            Self::write_satp(old);
            probed
        };
        // entries may have been created under the probe value
        self.fence_all(cpu);

        probed.implemented_asid_bits()
    }

    unsafe fn install(&self, cpu: CpuId, slot: usize, root: PhysicalAddress) {
        debug_assert_eq!(cpu, (self.current_hart)());

        // Safety: ensured by caller
        unsafe {
            Self::write_satp(Satp::for_address_space(self.mode, slot, root));
        }
    }

    fn fence_all(&self, _cpu: CpuId) {
        // Safety: invalidating translation caches is always sound
        unsafe {
            asm!("sfence.vma");
        }
    }

    fn fence_tag(&self, _cpu: CpuId, slot: usize) {
        // Safety: invalidating translation caches is always sound
        unsafe {
            asm!("sfence.vma zero, {}", in(reg) slot);
        }
    }

    fn fence_page(&self, _cpu: CpuId, slot: Option<usize>, address: VirtualAddress) {
        // Safety: invalidating translation caches is always sound
        unsafe {
            match slot {
                Some(slot) => asm!("sfence.vma {}, {}", in(reg) address.get(), in(reg) slot),
                None => asm!("sfence.vma {}, zero", in(reg) address.get()),
            }
        }
    }

    fn fence_i(&self, _cpu: CpuId) {
        // Safety: synchronizing the instruction cache is always sound
        unsafe {
            asm!("fence.i");
        }
    }

    fn poll_cross_calls(&self, cpu: CpuId) {
        debug_assert_eq!(cpu, (self.current_hart)());
        self.poll_mailbox(cpu);
    }

    fn cross_call(&self, targets: &CpuMask, f: &(dyn Fn(CpuId) + Sync)) {
        let me = (self.current_hart)();
        let remote = targets.without(me);

        if !remote.is_empty() {
            // Keep answering cross calls while waiting, the holder may be waiting for us.
            let _guard = loop {
                if let Some(guard) = self.cross_call_lock.try_lock() {
                    break guard;
                }
                self.poll_mailbox(me);
                core::hint::spin_loop();
            };

            let call = CrossCall {
                f,
                pending: AtomicUsize::new(remote.len()),
            };
            let posted = ptr::from_ref(&call).cast::<()>().cast_mut();
            for hart in &remote {
                self.mailboxes[hart.get()].store(posted, Ordering::Release);
            }

            for_each_hart_mask(Some(&remote), |mask, base| {
                if let Err(err) = sbi::send_ipi(mask, base) {
                    panic!("failed to send cross call IPI: {err}");
                }
            });

            if targets.contains(me) {
                f(me);
            }

            while call.pending.load(Ordering::Acquire) != 0 {
                core::hint::spin_loop();
            }
        } else if targets.contains(me) {
            f(me);
        }
    }

    fn remote_sfence_vma(&self, targets: Option<&CpuMask>, range: FlushRange, slot: Option<usize>) {
        let (start, size) = match range {
            FlushRange::All => (0, usize::MAX),
            FlushRange::Range { start, len } => (start.get(), len),
        };

        for_each_hart_mask(targets, |mask, base| {
            let res = match slot {
                Some(asid) => sbi::remote_sfence_vma_asid(mask, base, start, size, asid),
                None => sbi::remote_sfence_vma(mask, base, start, size),
            };

            if let Err(err) = res {
                panic!("remote sfence.vma failed: {err}");
            }
        });
    }

    fn remote_fence_i(&self, targets: Option<&CpuMask>) {
        for_each_hart_mask(targets, |mask, base| {
            if let Err(err) = sbi::remote_fence_i(mask, base) {
                panic!("remote fence.i failed: {err}");
            }
        });
    }
}
