// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The SBI calls used for remote invalidation: the RFENCE and IPI extensions.

use crate::Error;

const EID_IPI: usize = 0x735049;
const EID_RFNC: usize = 0x52464E43;

const FID_REMOTE_FENCE_I: usize = 0;
const FID_REMOTE_SFENCE_VMA: usize = 1;
const FID_REMOTE_SFENCE_VMA_ASID: usize = 2;
const FID_SEND_IPI: usize = 0;

/// A `hart_mask_base` of all ones selects every hart and ignores `hart_mask`.
pub const ALL_HARTS: usize = usize::MAX;

macro_rules! sbi_call {
    (ext: $ext:expr, func: $func:expr, $($reg:tt: $args:expr),*) => {{
        let error: isize;
        let ext: usize = $ext;
        let func: usize = $func;

        // Safety: inline assembly
        unsafe {
            ::core::arch::asm!(
                "ecall",
                $(in($reg) $args),*,
                in("a6") func, in("a7") ext,
                lateout("a0") error, lateout("a1") _,
            );
        }

        if error == 0 {
            Ok(())
        } else {
            Err(Error::Firmware(error))
        }
    }};
}

/// # Errors
///
/// Returns an error if the SBI call fails.
#[inline]
pub fn send_ipi(hart_mask: usize, hart_mask_base: usize) -> crate::Result<()> {
    sbi_call!(ext: EID_IPI, func: FID_SEND_IPI, "a0": hart_mask, "a1": hart_mask_base)
}

/// # Errors
///
/// Returns an error if the SBI call fails.
#[inline]
pub fn remote_fence_i(hart_mask: usize, hart_mask_base: usize) -> crate::Result<()> {
    sbi_call!(ext: EID_RFNC, func: FID_REMOTE_FENCE_I, "a0": hart_mask, "a1": hart_mask_base)
}

/// # Errors
///
/// Returns an error if the SBI call fails.
#[inline]
pub fn remote_sfence_vma(
    hart_mask: usize,
    hart_mask_base: usize,
    start_addr: usize,
    size: usize,
) -> crate::Result<()> {
    sbi_call!(ext: EID_RFNC, func: FID_REMOTE_SFENCE_VMA, "a0": hart_mask, "a1": hart_mask_base, "a2": start_addr, "a3": size)
}

/// # Errors
///
/// Returns an error if the SBI call fails.
#[inline]
pub fn remote_sfence_vma_asid(
    hart_mask: usize,
    hart_mask_base: usize,
    start_addr: usize,
    size: usize,
    asid: usize,
) -> crate::Result<()> {
    sbi_call!(ext: EID_RFNC, func: FID_REMOTE_SFENCE_VMA_ASID, "a0": hart_mask, "a1": hart_mask_base, "a2": start_addr, "a3": size, "a4": asid)
}
