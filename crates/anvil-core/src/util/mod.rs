//! Utility functions and types used throughout anvil.
//!
//! - Constants for memory operations ([`PAGE_SIZE`], [`ROW_SIZE`], etc.)
//! - [`median`] of timing samples
//! - Progress reporting utilities ([`NamedProgress`])
//! - Random number generation ([`Rng`])

mod alloc_util;
mod constants;
mod named_progress;
mod rng;

pub use self::alloc_util::*;
pub use self::constants::*;
pub use self::named_progress::NamedProgress;
pub use self::rng::Rng;

/// Median of a sample. Sorts `values` in place.
///
/// Returns `None` for an empty sample.
pub fn median(values: &mut [u64]) -> Option<u64> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2)
    } else {
        Some(values[mid])
    }
}
