//! DRAM address model, target memory and bit flip verification.
//!
//! - [`DRAMAddr`], [`MemConfiguration`] and [`DramConfig`] describe the DRAM
//!   under test and translate between virtual addresses and (bank, row, column).
//! - [`Memory`] is the contiguous target region.
//! - [`RefreshTimer`] synchronizes with DRAM refresh.
//! - [`MemCheck`] writes the [`DataPattern`] reference fill and reports [`BitFlip`]s.
//! - [`LinuxPageMap`] resolves physical addresses for reporting.
mod dram_addr;
mod dram_config;
mod mem_check;
mod mem_configuration;
mod memblock;
mod reference;
mod refresh_timer;
mod virt_to_phys;

pub use self::dram_addr::DRAMAddr;
pub use self::dram_config::{BitDef, ConfigError, DramConfig, DramConfigError, DramProfile};
pub use self::mem_check::MemCheck;
pub use self::mem_configuration::{MTX_SIZE, MemConfiguration};
pub use self::memblock::Memory;
pub use self::reference::{DataPattern, Reference};
pub use self::refresh_timer::{
    AccessTimer, Calibration, MAX_CALIBRATION_ROUNDS, MAX_SYNC_MEASUREMENTS, Measurement,
    PEAK_DECISION_MULTIPLIER, RdtscpTimer, RefreshTimer, SYNC_ROW_RESERVE, TimerError,
};
pub use self::virt_to_phys::{LinuxPageMap, LinuxPageMapError, PhysAddr, VirtToPhysResolver};

use serde::{Deserialize, Serialize};

/// Pointer type for aggressor row addresses.
pub type AggressorPtr = *const u8;

/// Trait for accessing memory as a byte pointer.
#[allow(clippy::len_without_is_empty)]
pub trait BytePointer {
    /// Returns a mutable pointer to the byte at the given offset.
    ///
    /// The returned pointer is valid only while the memory region exists.
    fn addr(&self, offset: usize) -> *mut u8;

    /// Returns a mutable pointer to the start of the memory region.
    fn ptr(&self) -> *mut u8;

    /// Returns the total length of the memory region in bytes.
    fn len(&self) -> usize;
}

/// Represents a bit flip detected in memory.
///
/// A bit flip is a change in memory where one or more bits differ from their
/// expected value.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BitFlip {
    /// Virtual address where the bit flip occurred
    pub addr: usize,
    /// Bitmask indicating which bits flipped (1 = bit flipped)
    pub bitmask: u8,
    /// The expected data value (before the flip)
    pub data: u8,
}

impl core::fmt::Debug for BitFlip {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BitFlip")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("bitmask", &format_args!("{:#x}", self.bitmask))
            .field("data", &format_args!("{:#x}", self.data))
            .finish()
    }
}

impl BitFlip {
    /// Constructor for BitFlip
    pub fn new(addr: *const u8, bitmask: u8, data: u8) -> Self {
        BitFlip {
            addr: addr as usize,
            bitmask,
            data,
        }
    }

    /// Number of bits that were 1 in the expected value and read back as 0.
    pub fn count_o2z_corruptions(&self) -> u32 {
        (self.bitmask & self.data).count_ones()
    }

    /// Number of bits that were 0 in the expected value and read back as 1.
    pub fn count_z2o_corruptions(&self) -> u32 {
        (self.bitmask & !self.data).count_ones()
    }
}

#[cfg(test)]
mod tests {
    use super::BitFlip;

    #[test]
    fn test_corruption_counts() {
        let flip = BitFlip::new(std::ptr::null(), 0b1010_0011, 0b1000_0010);
        assert_eq!(flip.count_o2z_corruptions(), 2);
        assert_eq!(flip.count_z2o_corruptions(), 2);
        let flip = BitFlip::new(std::ptr::null(), 0b0000_0100, 0xFF);
        assert_eq!(flip.count_o2z_corruptions(), 1);
        assert_eq!(flip.count_z2o_corruptions(), 0);
    }
}
