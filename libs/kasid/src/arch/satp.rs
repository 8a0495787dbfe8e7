// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Layout of the RV64 `satp` (supervisor address translation and protection) register.

use crate::address::PhysicalAddress;

mycelium_bitfield::bitfield! {
    /// The RV64 `satp` register.
    #[derive(Eq, PartialEq)]
    pub struct Satp<usize> {
        /// Physical page number of the root page table.
        pub const PPN = 44;
        /// Address space identifier, the hardware tag.
        pub const ASID = 16;
        /// Address translation scheme, see [`Mode`].
        pub const MODE = 4;
    }
}

/// Address translation schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Mode {
    Bare = 0,
    Sv39 = 8,
    Sv48 = 9,
    Sv57 = 10,
}

const PAGE_SHIFT: u32 = 12;

impl Satp {
    /// Returns the register value that switches to `root` tagged with `asid`.
    #[must_use]
    pub fn for_address_space(mode: Mode, asid: usize, root: PhysicalAddress) -> Self {
        debug_assert!(root.is_aligned_to(1 << PAGE_SHIFT));

        Self::new()
            .with(Self::MODE, mode as usize)
            .with(Self::ASID, asid)
            .with(Self::PPN, root.get() >> PAGE_SHIFT)
    }

    #[must_use]
    pub fn root(self) -> PhysicalAddress {
        PhysicalAddress::new(self.get(Self::PPN) << PAGE_SHIFT)
    }

    /// Returns `self` with every bit of the ASID field set, used to probe how many bits the
    /// hardware implements.
    #[must_use]
    pub fn with_all_asid_bits(self) -> Self {
        self.with(Self::ASID, Self::ASID.max_value())
    }

    /// Returns the number of ASID bits that read back as set.
    ///
    /// The field is WARL and implementations fill it from the least significant bit, so after
    /// writing all ones the position of the highest set bit is the implemented width.
    #[must_use]
    pub fn implemented_asid_bits(self) -> u32 {
        usize::BITS - self.get(Self::ASID).leading_zeros()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn field_positions() {
        let satp = Satp::for_address_space(Mode::Sv39, 0x1f, PhysicalAddress::new(0x8020_3000));

        assert_eq!(
            satp.bits(),
            (8 << 60) | (0x1f << 44) | (0x8020_3000 >> 12)
        );
        assert_eq!(satp.root(), PhysicalAddress::new(0x8020_3000));
        assert_eq!(satp.get(Satp::ASID), 0x1f);
    }

    #[test]
    fn probe_width() {
        let satp = Satp::for_address_space(Mode::Sv48, 0, PhysicalAddress::new(0x1000));
        assert_eq!(satp.with_all_asid_bits().implemented_asid_bits(), 16);

        // hardware implementing 9 bits hardwires the upper 7 to zero
        let probed = Satp::from_bits(satp.bits() | (0x1ff << 44));
        assert_eq!(probed.implemented_asid_bits(), 9);

        assert_eq!(satp.implemented_asid_bits(), 0);
    }
}
