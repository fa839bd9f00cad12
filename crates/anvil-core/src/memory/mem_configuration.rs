use crate::memory::{BitDef, ConfigError};
use crate::util::ROW_SHIFT;
use nalgebra::SMatrix;
use serde::{Deserialize, Serialize};

/// Size of DRAM addressing matrices
pub const MTX_SIZE: usize = 30;

/// DRAM addressing configuration.
///
/// Defines how virtual addresses map to physical DRAM organization
/// (bank, row, column) using transformation matrices over GF(2).
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct MemConfiguration {
    /// Bit shift for bank extraction
    pub bk_shift: usize,
    /// Bit mask for bank extraction
    pub bk_mask: usize,
    /// Bit shift for row extraction
    pub row_shift: usize,
    /// Bit mask for row extraction
    pub row_mask: usize,
    /// Bit shift for column extraction
    pub col_shift: usize,
    /// Bit mask for column extraction
    pub col_mask: usize,
    /// DRAM addressing matrix (virtual to DRAM)
    pub dram_mtx: [usize; MTX_SIZE],
    /// Address reconstruction matrix (DRAM to virtual)
    pub addr_mtx: [usize; MTX_SIZE],
    /// Maximum bank bit position
    pub max_bank_bit: u64,
}

impl MemConfiguration {
    /// Returns the periodicity of the bank function in rows.
    ///
    /// Indicates how many rows must be iterated before the bank function repeats.
    pub fn bank_function_period(&self) -> u64 {
        1 << (self.max_bank_bit + 1 - ROW_SHIFT as u64)
    }
}

impl MemConfiguration {
    /// Returns the number of banks in this DRAM configuration.
    pub fn get_bank_count(&self) -> usize {
        1_usize << (self.bk_mask.count_ones() as usize)
    }

    /// Returns the number of rows in this DRAM configuration.
    pub fn get_row_count(&self) -> usize {
        1_usize << (self.row_mask.count_ones() as usize)
    }

    /// Returns the number of columns (bytes per row) in this DRAM configuration.
    pub fn get_col_count(&self) -> usize {
        1_usize << (self.col_mask.count_ones() as usize)
    }
}

impl MemConfiguration {
    /// Builds the addressing function from bit definitions.
    ///
    /// The DRAM matrix holds bank functions first, then columns, then rows.
    /// The address matrix is its inverse.
    ///
    /// # Errors
    ///
    /// Returns an error if the definitions do not cover exactly [`MTX_SIZE`]
    /// bits or the resulting matrix has no inverse over GF(2).
    pub fn from_bitdefs(
        bank_bits: Vec<BitDef>,
        row_bits: Vec<BitDef>,
        col_bits: Vec<BitDef>,
    ) -> Result<Self, ConfigError> {
        let mut out = MemConfiguration::default();
        let total = bank_bits.len() + col_bits.len() + row_bits.len();
        if total != MTX_SIZE {
            return Err(ConfigError::BitCount {
                expected: MTX_SIZE,
                got: total,
            });
        }

        out.bk_shift = MTX_SIZE - bank_bits.len();
        out.bk_mask = (1 << bank_bits.len()) - 1;
        out.col_shift = MTX_SIZE - bank_bits.len() - col_bits.len();
        out.col_mask = (1 << col_bits.len()) - 1;
        out.row_shift = MTX_SIZE - bank_bits.len() - col_bits.len() - row_bits.len();
        out.row_mask = (1 << row_bits.len()) - 1;
        out.max_bank_bit = bank_bits
            .iter()
            .filter_map(BitDef::max_bit)
            .max()
            .ok_or(ConfigError::NoBankBits)?;

        let mut dram_mtx: [usize; MTX_SIZE] = [0; MTX_SIZE];
        for (i, def) in bank_bits
            .iter()
            .chain(col_bits.iter())
            .chain(row_bits.iter())
            .enumerate()
        {
            dram_mtx[i] = def.to_bitstr();
        }
        out.dram_mtx = dram_mtx;

        let mut matrix = SMatrix::<u8, MTX_SIZE, MTX_SIZE>::zeros();
        for row in 0..MTX_SIZE {
            for col in 0..MTX_SIZE {
                matrix[(row, col)] = ((dram_mtx[row] >> (MTX_SIZE - col - 1)) & 1) as u8;
            }
        }
        let matrix_inv = matrix
            .cast::<f64>()
            .try_inverse()
            .ok_or(ConfigError::NotInvertible)?;

        let mut addr_mtx: [usize; MTX_SIZE] = [0; MTX_SIZE];
        for row in 0..MTX_SIZE {
            for col in 0..MTX_SIZE {
                let raw = matrix_inv[(row, col)];
                let e = raw.round().abs();
                if (raw - raw.round()).abs() > 1e-6 || (e != 0.0 && e != 1.0) {
                    return Err(ConfigError::NonBinaryInverse(raw));
                }
                addr_mtx[row] |= (e as usize) << (MTX_SIZE - col - 1);
            }
        }
        out.addr_mtx = addr_mtx;
        Ok(out)
    }
}
