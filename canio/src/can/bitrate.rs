use std::fmt;

use serde::Deserialize;

/// Values of the two bus timing registers (BTR0/BTR1) of an SJA1000-style
/// controller. Together they select the bit rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub struct BitratePair {
    pub btr0: u8,
    pub btr1: u8,
}

impl BitratePair {
    pub const fn new(btr0: u8, btr1: u8) -> Self {
        BitratePair { btr0, btr1 }
    }

    /// Nominal bit rate of a catalog entry. Custom register pairs yield `None`.
    pub fn bits_per_second(&self) -> Option<u32> {
        CATALOG
            .iter()
            .zip(CATALOG_RATES)
            .find(|(pair, _)| *pair == self)
            .map(|(_, rate)| rate)
    }
}

impl fmt::Display for BitratePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bits_per_second() {
            Some(rate) => write!(
                f,
                "{} kbit/s ({:#04x}, {:#04x})",
                rate / 1000,
                self.btr0,
                self.btr1
            ),
            None => write!(f, "({:#04x}, {:#04x})", self.btr0, self.btr1),
        }
    }
}

pub const BITRATE_10K: BitratePair = BitratePair::new(0x31, 0x1c);
pub const BITRATE_20K: BitratePair = BitratePair::new(0x18, 0x1c);
pub const BITRATE_25K: BitratePair = BitratePair::new(0x1f, 0x16);
pub const BITRATE_50K: BitratePair = BitratePair::new(0x09, 0x1c);
pub const BITRATE_100K: BitratePair = BitratePair::new(0x04, 0x1c);
pub const BITRATE_125K: BitratePair = BitratePair::new(0x03, 0x1c);
pub const BITRATE_250K: BitratePair = BitratePair::new(0x01, 0x1c);
pub const BITRATE_500K: BitratePair = BitratePair::new(0x00, 0x1c);
pub const BITRATE_800K: BitratePair = BitratePair::new(0x00, 0x16);
pub const BITRATE_1000K: BitratePair = BitratePair::new(0x00, 0x14);

/// Every standard rate, slowest first.
pub const CATALOG: [BitratePair; 10] = [
    BITRATE_10K,
    BITRATE_20K,
    BITRATE_25K,
    BITRATE_50K,
    BITRATE_100K,
    BITRATE_125K,
    BITRATE_250K,
    BITRATE_500K,
    BITRATE_800K,
    BITRATE_1000K,
];

const CATALOG_RATES: [u32; 10] = [
    10_000, 20_000, 25_000, 50_000, 100_000, 125_000, 250_000, 500_000, 800_000, 1_000_000,
];
