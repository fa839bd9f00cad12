use crate::memory::{Calibration, MemConfiguration};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;

/// Defines which physical address bits are used for DRAM mapping.
///
/// Can specify a single bit or multiple bits for row/column/bank functions.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum BitDef {
    /// Single bit function
    Single(u64),
    /// XOR of multiple bits
    Multi(Vec<u64>),
}

impl BitDef {
    /// Converts bit definition to a bitmask with bits set at the specified positions.
    pub fn to_bitstr(&self) -> usize {
        let mut res: usize = 0;
        match self {
            BitDef::Single(bit) => {
                res |= 1 << bit;
            }
            BitDef::Multi(bits) => {
                bits.iter().for_each(|bit| {
                    res |= 1 << bit;
                });
            }
        }
        res
    }

    /// Highest address bit taking part in this function.
    pub fn max_bit(&self) -> Option<u64> {
        match self {
            BitDef::Single(bit) => Some(*bit),
            BitDef::Multi(bits) => bits.iter().max().copied(),
        }
    }
}

/// Errors that can occur when loading a DRAM profile.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading the profile
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    /// The profile is not valid JSON
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
    /// Bank, row and column definitions must cover the full matrix
    #[error("bit definitions cover {got} bits, expected {expected}")]
    BitCount {
        /// Required number of definitions
        expected: usize,
        /// Number of definitions found
        got: usize,
    },
    /// No bank functions defined
    #[error("profile defines no bank bits")]
    NoBankBits,
    /// The DRAM matrix is singular
    #[error("the addressing matrix defined in the profile is not invertible")]
    NotInvertible,
    /// The inverse exists over the reals but not over GF(2)
    #[error("expected inverse element to be 0 or 1, got {0}")]
    NonBinaryInverse(f64),
}

/// A DRAM profile as stored in JSON.
///
/// Carries the reverse-engineered addressing functions and some geometry
/// information about the target system.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DramProfile {
    /// Human-readable profile name
    pub name: String,
    /// Number of memory channels
    #[serde(default = "one")]
    pub channels: u64,
    /// DIMMs per channel
    #[serde(default = "one")]
    pub dimms: u64,
    /// Ranks per DIMM
    #[serde(default = "one")]
    pub ranks: u64,
    /// Total number of banks visible through the addressing function
    pub total_banks: u64,
    /// Number of rows per bank
    pub max_rows: u64,
    /// Timing threshold for bank conflict detection (in CPU cycles)
    pub threshold: u64,
    /// Fixed number of activations per refresh interval. Measured during
    /// calibration when absent.
    #[serde(default)]
    pub acts_per_trefi: Option<u64>,
    /// Physical address bits used for DRAM row selection
    pub row_bits: Vec<BitDef>,
    /// Physical address bits used for DRAM column selection
    pub col_bits: Vec<BitDef>,
    /// Physical address bits used for DRAM bank selection
    pub bank_bits: Vec<BitDef>,
}

fn one() -> u64 {
    1
}

impl DramProfile {
    /// Loads a profile from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_jsonfile<P: AsRef<Path>>(filepath: P) -> Result<DramProfile, ConfigError> {
        let mut file = File::open(filepath.as_ref())?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let config: DramProfile = serde_json::from_str(&contents)?;
        Ok(config)
    }
}

/// Errors raised when updating a [`DramConfig`].
#[derive(Debug, Error)]
pub enum DramConfigError {
    /// The refresh calibration slot is write-once
    #[error("refresh calibration was already set ({0:?})")]
    AlreadyCalibrated(Calibration),
}

/// Configuration of the DRAM under test.
///
/// Built once from a [`DramProfile`] and then shared by reference with every
/// component. The refresh calibration is the only late-bound part; it is
/// written exactly once before any hammering thread starts.
#[derive(Debug)]
pub struct DramConfig {
    /// Profile name
    pub name: String,
    /// Number of memory channels
    pub channels: u64,
    /// DIMMs per channel
    pub dimms: u64,
    /// Ranks per DIMM
    pub ranks: u64,
    /// The addressing function
    pub mem_config: MemConfiguration,
    /// Bank conflict threshold in cycles
    pub threshold: u64,
    fixed_acts_per_trefi: Option<u64>,
    calibration: OnceLock<Calibration>,
}

impl DramConfig {
    /// Builds the configuration from a parsed profile.
    ///
    /// # Errors
    ///
    /// Returns an error if the addressing function cannot be inverted.
    pub fn from_profile(profile: DramProfile) -> Result<Self, ConfigError> {
        let mem_config =
            MemConfiguration::from_bitdefs(profile.bank_bits, profile.row_bits, profile.col_bits)?;
        info!(
            "DRAM profile {}: {} banks, {} rows, bank function period {}",
            profile.name,
            mem_config.get_bank_count(),
            mem_config.get_row_count(),
            mem_config.bank_function_period()
        );
        Ok(DramConfig {
            name: profile.name,
            channels: profile.channels,
            dimms: profile.dimms,
            ranks: profile.ranks,
            mem_config,
            threshold: profile.threshold,
            fixed_acts_per_trefi: profile.acts_per_trefi,
            calibration: OnceLock::new(),
        })
    }

    /// Loads and builds the configuration from a JSON profile.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, parsed, or inverted.
    pub fn from_jsonfile<P: AsRef<Path>>(filepath: P) -> Result<Self, ConfigError> {
        Self::from_profile(DramProfile::from_jsonfile(filepath)?)
    }

    /// Stores the refresh calibration.
    ///
    /// # Errors
    ///
    /// Returns [`DramConfigError::AlreadyCalibrated`] on a second call.
    pub fn set_calibration(&self, calibration: Calibration) -> Result<(), DramConfigError> {
        self.calibration
            .set(calibration)
            .map_err(|_| DramConfigError::AlreadyCalibrated(calibration))
    }

    /// The refresh calibration, if already measured.
    pub fn calibration(&self) -> Option<&Calibration> {
        self.calibration.get()
    }

    /// Activations per refresh interval.
    ///
    /// A fixed value from the profile wins over the measured one.
    pub fn acts_per_trefi(&self) -> Option<u64> {
        self.fixed_acts_per_trefi
            .or_else(|| self.calibration().map(|c| c.acts_per_refresh))
    }

    /// Number of banks of the addressing function.
    pub fn banks(&self) -> usize {
        self.mem_config.get_bank_count()
    }
}

#[cfg(test)]
mod tests {
    use super::{BitDef, DramConfig, DramConfigError, DramProfile};
    use crate::memory::Calibration;

    const CONFIG: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/bs-config.json");

    #[test]
    fn test_bitdef_untagged() {
        let defs: Vec<BitDef> = serde_json::from_str("[6, [13, 17]]").expect("json");
        assert_eq!(defs, vec![BitDef::Single(6), BitDef::Multi(vec![13, 17])]);
        assert_eq!(defs[1].to_bitstr(), (1 << 13) | (1 << 17));
        assert_eq!(defs[1].max_bit(), Some(17));
    }

    #[test]
    fn test_load_profile() {
        let profile = DramProfile::from_jsonfile(CONFIG).expect("profile");
        assert_eq!(profile.total_banks, 32);
        assert_eq!(profile.bank_bits.len(), 5);
    }

    #[test]
    fn test_calibration_write_once() {
        let config = DramConfig::from_jsonfile(CONFIG).expect("config");
        let first = Calibration {
            threshold: 300,
            cycles_per_refresh: 5000,
            acts_per_refresh: 80,
            rounds: 2,
        };
        assert!(config.calibration().is_none());
        config.set_calibration(first).expect("first write");
        let second = Calibration {
            threshold: 1,
            ..first
        };
        assert!(matches!(
            config.set_calibration(second),
            Err(DramConfigError::AlreadyCalibrated(_))
        ));
        assert_eq!(config.calibration(), Some(&first));
    }

    #[test]
    fn test_fixed_acts_override() {
        let mut profile = DramProfile::from_jsonfile(CONFIG).expect("profile");
        profile.acts_per_trefi = Some(64);
        let config = DramConfig::from_profile(profile).expect("config");
        config
            .set_calibration(Calibration {
                threshold: 300,
                cycles_per_refresh: 5000,
                acts_per_refresh: 90,
                rounds: 2,
            })
            .expect("calibration");
        assert_eq!(config.acts_per_trefi(), Some(64));
    }
}
