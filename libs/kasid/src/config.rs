// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::str::FromStr;

use crate::Error;

/// How invalidations reach other processors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Delivery {
    /// Interrupt the targets and have each one flush its own caches.
    Ipi,
    /// Ask the firmware (the SBI RFENCE extension on RISC-V) to do it.
    #[default]
    Firmware,
}

impl FromStr for Delivery {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ipi" => Ok(Self::Ipi),
            "sbi" | "firmware" => Ok(Self::Firmware),
            _ => Err(Error::UnknownDelivery),
        }
    }
}

/// Boot-time configuration of the [`TagManager`](crate::TagManager).
///
/// Parsed from the kernel command line as `;`-separated `key=value` pairs, unknown keys are
/// ignored so the whole command line can be passed in:
///
/// ```
/// # use kasid::{Config, Delivery};
/// let config: Config = "log=trace;tlb_flush_threshold=16;tlb_delivery=ipi".parse().unwrap();
/// assert_eq!(config.flush_threshold, 16);
/// assert_eq!(config.delivery, Delivery::Ipi);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Ranged invalidations spanning more pages than this are widened to full flushes.
    pub flush_threshold: usize,
    pub delivery: Delivery,
    /// Use at most this many hardware tag bits, even if the hardware implements more.
    pub tag_bits: Option<u32>,
    /// Limit the generation counter to this many bits.
    pub generation_bits: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flush_threshold: 1,
            delivery: Delivery::default(),
            tag_bits: None,
            generation_bits: None,
        }
    }
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut config = Self::default();

        for part in s.trim().split(';').map(str::trim) {
            if let Some(current) = part.strip_prefix("tlb_flush_threshold=") {
                config.flush_threshold = current.parse().map_err(|_| Error::InvalidConfig {
                    key: "tlb_flush_threshold",
                })?;
            }

            if let Some(current) = part.strip_prefix("tlb_delivery=") {
                config.delivery = Delivery::from_str(current)?;
            }

            if let Some(current) = part.strip_prefix("asid_bits=") {
                config.tag_bits = Some(
                    current
                        .parse()
                        .map_err(|_| Error::InvalidConfig { key: "asid_bits" })?,
                );
            }
        }

        Ok(config)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::from_str("").unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(config.flush_threshold, 1);
        assert_eq!(config.delivery, Delivery::Firmware);
        assert_eq!(config.tag_bits, None);
    }

    #[test]
    fn parses_known_keys() {
        let config =
            Config::from_str("tlb_flush_threshold=64; tlb_delivery=sbi ;asid_bits=9").unwrap();

        assert_eq!(config.flush_threshold, 64);
        assert_eq!(config.delivery, Delivery::Firmware);
        assert_eq!(config.tag_bits, Some(9));
    }

    #[test]
    fn ignores_unknown_keys() {
        let config = Config::from_str("log=debug;backtrace=full;tlb_delivery=ipi").unwrap();

        assert_eq!(config.delivery, Delivery::Ipi);
        assert_eq!(config.flush_threshold, 1);
    }

    #[test]
    fn rejects_malformed_values() {
        assert_eq!(
            Config::from_str("tlb_flush_threshold=lots"),
            Err(Error::InvalidConfig {
                key: "tlb_flush_threshold"
            })
        );
        assert_eq!(
            Config::from_str("tlb_delivery=carrier-pigeon"),
            Err(Error::UnknownDelivery)
        );
        assert_eq!(
            Config::from_str("asid_bits=-1"),
            Err(Error::InvalidConfig { key: "asid_bits" })
        );
    }
}
