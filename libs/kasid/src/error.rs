// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt::{Display, Formatter};

use crate::cpu_set::CpuId;

/// Errors returned by this crate.
///
/// Conditions that leave the translation caches in an unknown state (tag exhaustion right after a
/// rollover, generation overflow on wide layouts, rejected firmware calls) are not represented
/// here, they panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A secondary processor implements a different number of tag bits than the boot processor.
    TagWidthMismatch {
        cpu: CpuId,
        expected: u32,
        found: u32,
    },
    /// A configuration value could not be parsed.
    InvalidConfig { key: &'static str },
    /// The requested invalidation delivery mechanism is not known.
    UnknownDelivery,
    /// The firmware rejected a call with the given error code.
    Firmware(isize),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::TagWidthMismatch {
                cpu,
                expected,
                found,
            } => write!(
                f,
                "cpu {cpu} implements {found} address space tag bits, expected {expected}"
            ),
            Error::InvalidConfig { key } => write!(f, "invalid value for `{key}`"),
            Error::UnknownDelivery => {
                f.write_str("unknown invalidation delivery, expected `ipi` or `sbi`")
            }
            Error::Firmware(code) => write!(f, "firmware call failed with error code {code}"),
        }
    }
}

impl core::error::Error for Error {}
