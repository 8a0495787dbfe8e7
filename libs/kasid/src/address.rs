// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// The base page size, the granularity of ranged invalidations.
pub const PAGE_SIZE: usize = 4096;

macro_rules! impl_address {
    ($address_ty:ident) => {
        impl $address_ty {
            #[must_use]
            pub const fn new(n: usize) -> Self {
                Self(n)
            }

            #[inline]
            pub const fn get(self) -> usize {
                self.0
            }

            /// Adds an unsigned offset to this address, panicking if overflow occurred.
            #[must_use]
            #[inline]
            pub const fn add(self, offset: usize) -> Self {
                Self(self.0 + offset)
            }

            #[must_use]
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                debug_assert!(align.is_power_of_two());
                Self(self.0 & !(align - 1))
            }

            #[must_use]
            #[inline]
            pub const fn is_aligned_to(self, align: usize) -> bool {
                debug_assert!(align.is_power_of_two());
                self.0 & (align - 1) == 0
            }
        }

        impl fmt::Display for $address_ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#018x}", self.0)
            }
        }

        impl fmt::Debug for $address_ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($address_ty))
                    .field(&format_args!("{:#018x}", self.0))
                    .finish()
            }
        }
    };
}

#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtualAddress(usize);
impl_address!(VirtualAddress);

#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysicalAddress(usize);
impl_address!(PhysicalAddress);

/// Returns the page-aligned addresses of every page touched by `start..start + len`.
pub(crate) fn pages(start: VirtualAddress, len: usize) -> impl Iterator<Item = VirtualAddress> {
    let first = start.align_down(PAGE_SIZE).get();
    let end = start.get().saturating_add(len);

    (first..end)
        .step_by(PAGE_SIZE)
        .map(VirtualAddress::new)
}

/// Returns the number of pages touched by `start..start + len`.
pub(crate) fn page_count(start: VirtualAddress, len: usize) -> usize {
    if len == 0 {
        return 0;
    }

    let first = start.align_down(PAGE_SIZE).get();
    let end = start.get().saturating_add(len);
    (end - first).div_ceil(PAGE_SIZE)
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn page_count_counts_touched_pages() {
        let base = VirtualAddress::new(0x8000_0000);

        assert_eq!(page_count(base, 0), 0);
        assert_eq!(page_count(base, 1), 1);
        assert_eq!(page_count(base, PAGE_SIZE), 1);
        assert_eq!(page_count(base, PAGE_SIZE + 1), 2);
        assert_eq!(page_count(base, 2 * PAGE_SIZE), 2);
        // an unaligned start straddles a page boundary
        assert_eq!(page_count(base.add(PAGE_SIZE - 8), 16), 2);
    }

    #[test]
    fn pages_yields_aligned_addresses() {
        let start = VirtualAddress::new(0x1000 + 0x10);
        let pages: Vec<_> = pages(start, 2 * PAGE_SIZE).collect();

        assert_eq!(
            pages,
            [
                VirtualAddress::new(0x1000),
                VirtualAddress::new(0x2000),
                VirtualAddress::new(0x3000)
            ]
        );
        assert_eq!(pages.len(), page_count(start, 2 * PAGE_SIZE));
    }
}
