//! Hammering patterns and their mapping to DRAM.
//!
//! A [`HammeringPattern`] is an address-independent sequence of [`Aggressor`] ids,
//! generated by [`FrequencyPatternBuilder`] or [`SimplePatternBuilder`] from a
//! [`FuzzingParameterSet`]. A [`PatternAddressMapper`] binds the ids to rows of one bank
//! and exports the pattern as the access sequence a kernel runs.

mod address_set;
mod aggressor;
mod frequency;
mod hammering_pattern;
mod mapper;
mod params;
mod placement;
mod scheduling;
mod simple;

pub use self::address_set::{AddressSetBuilder, MAX_MAPPING_RETRIES};
pub use self::aggressor::{Aggressor, AggressorAccessPattern};
pub use self::frequency::{FrequencyPatternBuilder, MIN_SLOTS, PlacementStats};
pub use self::hammering_pattern::HammeringPattern;
pub use self::mapper::{MappingError, PatternAddressMapper, VICTIM_ROWS};
pub use self::params::*;
pub use self::placement::{PlacementOutcome, PlacementState};
pub use self::scheduling::schedule;
pub use self::simple::{SIMPLE_GROUPS, SimplePatternBuilder};

use crate::util::Rng;

/// Trait for pattern generators.
pub trait PatternGenerator {
    /// Generates one pattern, drawing every random decision from `rng`.
    fn generate(&self, rng: &mut Rng) -> HammeringPattern;
}
