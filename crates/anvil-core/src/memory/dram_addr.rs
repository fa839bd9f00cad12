use crate::memory::AggressorPtr;
use crate::memory::MemConfiguration;
use crate::util::MTX_ADDR_MASK;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// DRAM address with bank, row, and column components.
///
/// Represents the physical organization of a memory address in DRAM,
/// decoded from a virtual address using the active [`MemConfiguration`].
/// Values are never mutated in place; offsetting returns a new address.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub struct DRAMAddr {
    /// Bank number
    pub bank: usize,
    /// Row number
    pub row: usize,
    /// Column number
    pub col: usize,
}

impl Display for DRAMAddr {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        write!(fmt, "({}, {}, {})", self.bank, self.row, self.col)
    }
}

impl DRAMAddr {
    /// Creates a new DRAM address.
    pub fn new(bank: usize, row: usize, col: usize) -> Self {
        DRAMAddr { bank, row, col }
    }

    /// Decodes a virtual address into DRAM components.
    ///
    /// Only the low 30 bits of `addr` take part in the decoding, so the
    /// result is only meaningful for memory that is physically contiguous
    /// and aligned to 1 GiB.
    pub fn from_virt(addr: AggressorPtr, mem_config: &MemConfiguration) -> DRAMAddr {
        let p = addr as usize;
        let mut res = 0;

        for &i in mem_config.dram_mtx.iter() {
            res <<= 1;
            res |= (p & i).count_ones() as usize & 1;
        }
        let bank = (res >> mem_config.bk_shift) & mem_config.bk_mask;
        let row = (res >> mem_config.row_shift) & mem_config.row_mask;
        let col = (res >> mem_config.col_shift) & mem_config.col_mask;

        DRAMAddr { bank, row, col }
    }

    /// Linearizes DRAM address components into a single value.
    pub fn linearize(&self, mem_config: &MemConfiguration) -> usize {
        (self.actual_bank(mem_config) << mem_config.bk_shift)
            | (self.actual_row(mem_config) << mem_config.row_shift)
            | (self.actual_col(mem_config) << mem_config.col_shift)
    }

    /// Converts the DRAM address back to a virtual address inside the 1 GiB
    /// region containing `base_msb`.
    pub fn to_virt(&self, base_msb: AggressorPtr, mem_config: &MemConfiguration) -> AggressorPtr {
        let mut res = 0;
        let l = self.linearize(mem_config);
        for &i in mem_config.addr_mtx.iter() {
            res <<= 1;
            res |= (l & i).count_ones() as usize % 2;
        }
        let base_msb_usize = (base_msb as usize) & !MTX_ADDR_MASK;
        (base_msb_usize | res) as AggressorPtr
    }
}

impl DRAMAddr {
    /// Bank reduced to the configured bank range.
    pub fn actual_bank(&self, mem_config: &MemConfiguration) -> usize {
        self.bank % mem_config.get_bank_count()
    }

    /// Row reduced to the configured row range.
    pub fn actual_row(&self, mem_config: &MemConfiguration) -> usize {
        self.row % mem_config.get_row_count()
    }

    /// Column reduced to the configured column range.
    pub fn actual_col(&self, mem_config: &MemConfiguration) -> usize {
        self.col % mem_config.get_col_count()
    }
}

impl DRAMAddr {
    /// Adds offsets to each DRAM address component.
    ///
    /// No range reduction happens here; use [`DRAMAddr::checked_add`] when
    /// the result must stay inside the configured geometry.
    pub fn add(&self, bank: usize, row: usize, col: usize) -> DRAMAddr {
        DRAMAddr {
            bank: self.bank + bank,
            row: self.row + row,
            col: self.col + col,
        }
    }

    /// Subtracts offsets from each DRAM address component.
    pub fn sub(&self, bank: usize, row: usize, col: usize) -> DRAMAddr {
        DRAMAddr {
            bank: self.bank - bank,
            row: self.row - row,
            col: self.col - col,
        }
    }

    /// Offsets the address by signed deltas.
    ///
    /// Bank and column wrap around inside their configured ranges. Returns
    /// `None` if the row wraps: the new row is numerically below the original
    /// for a positive offset, above it for a negative one, or outside the
    /// configured row range.
    pub fn checked_add(
        &self,
        bank: isize,
        row: isize,
        col: isize,
        mem_config: &MemConfiguration,
    ) -> Option<DRAMAddr> {
        let rows = mem_config.get_row_count();
        let new_row = self.row.checked_add_signed(row)?;
        if new_row >= rows {
            return None;
        }
        if (row > 0 && new_row < self.row) || (row < 0 && new_row > self.row) {
            return None;
        }
        let banks = mem_config.get_bank_count() as isize;
        let cols = mem_config.get_col_count() as isize;
        Some(DRAMAddr {
            bank: (self.bank as isize + bank).rem_euclid(banks) as usize,
            row: new_row,
            col: (self.col as isize + col).rem_euclid(cols) as usize,
        })
    }

    /// The address two rows above, i.e. the partner of a double-sided pair
    /// straddling one victim row.
    pub fn distance_two(&self, mem_config: &MemConfiguration) -> Option<DRAMAddr> {
        self.checked_add(0, 2, 0, mem_config)
    }
}
