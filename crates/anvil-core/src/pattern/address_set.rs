//! Random DRAM address selection inside one allocation.
//!
//! [`AddressSetBuilder`] is the candidate engine of the mapper: every
//! address it hands out decodes to a row below the sync reserve of its bank
//! and lies inside the allocation.

use crate::memory::{DRAMAddr, MemConfiguration, SYNC_ROW_RESERVE};
use crate::util::Rng;
use rand::Rng as _;
use std::ops::Range;

/// Attempts per address before giving up.
pub const MAX_MAPPING_RETRIES: usize = 512;

/// Picks valid DRAM addresses inside an allocation.
#[derive(Debug, Clone)]
pub struct AddressSetBuilder<'a> {
    mem_config: &'a MemConfiguration,
    bounds: Range<usize>,
}

impl<'a> AddressSetBuilder<'a> {
    /// Creates a builder for the allocation covering `bounds`.
    pub fn new(mem_config: &'a MemConfiguration, bounds: Range<usize>) -> Self {
        AddressSetBuilder { mem_config, bounds }
    }

    /// Rows available for aggressors in every bank.
    pub fn usable_rows(&self) -> Range<usize> {
        0..self
            .mem_config
            .get_row_count()
            .saturating_sub(SYNC_ROW_RESERVE)
    }

    /// Virtual address of `addr` inside the allocation.
    pub fn to_virt(&self, addr: &DRAMAddr) -> usize {
        addr.to_virt(self.bounds.start as *const u8, self.mem_config) as usize
    }

    /// Returns true if `addr` is inside the geometry, below the sync reserve
    /// and maps into the allocation.
    pub fn is_valid(&self, addr: &DRAMAddr) -> bool {
        addr.bank < self.mem_config.get_bank_count()
            && self.usable_rows().contains(&addr.row)
            && addr.col < self.mem_config.get_col_count()
            && self.bounds.contains(&self.to_virt(addr))
    }

    /// Draws a valid address in `bank` with a row from `rows` that passes `accept`.
    pub fn random_address(
        &self,
        bank: usize,
        rows: Range<usize>,
        rng: &mut Rng,
        accept: impl Fn(&DRAMAddr) -> bool,
    ) -> Option<DRAMAddr> {
        if rows.is_empty() {
            return None;
        }
        (0..MAX_MAPPING_RETRIES)
            .map(|_| DRAMAddr::new(bank, rng.random_range(rows.clone()), 0))
            .find(|addr| self.is_valid(addr) && accept(addr))
    }

    /// Draws a valid pair `(first, first + distance rows)` in `bank`.
    ///
    /// Candidates whose partner wraps around the row range are rejected.
    pub fn random_pair(
        &self,
        bank: usize,
        rows: Range<usize>,
        distance: usize,
        rng: &mut Rng,
        accept: impl Fn(&DRAMAddr) -> bool,
    ) -> Option<(DRAMAddr, DRAMAddr)> {
        if rows.is_empty() {
            return None;
        }
        for _ in 0..MAX_MAPPING_RETRIES {
            let first = DRAMAddr::new(bank, rng.random_range(rows.clone()), 0);
            let Some(second) = first.checked_add(0, distance as isize, 0, self.mem_config) else {
                continue;
            };
            if first != second
                && self.is_valid(&first)
                && self.is_valid(&second)
                && accept(&first)
                && accept(&second)
            {
                return Some((first, second));
            }
        }
        None
    }

    /// The first valid address in `bank` at or above `start_row` that passes `accept`.
    pub fn sequential_address(
        &self,
        bank: usize,
        start_row: usize,
        accept: impl Fn(&DRAMAddr) -> bool,
    ) -> Option<DRAMAddr> {
        (start_row..self.usable_rows().end)
            .take(MAX_MAPPING_RETRIES)
            .map(|row| DRAMAddr::new(bank, row, 0))
            .find(|addr| self.is_valid(addr) && accept(addr))
    }

}
