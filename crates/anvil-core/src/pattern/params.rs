//! Randomized knobs of a fuzzing run.

use crate::util::Rng;
use log::{debug, warn};
use rand::Rng as _;
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use rand::seq::{IndexedRandom, SliceRandom};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Activations the kernel performs per hammering run.
pub const HAMMERING_ACTIVATIONS: usize = 5_000_000;
/// Number of aggressor ids available to a pattern.
pub const NUM_AGGRESSORS: ParamRange = ParamRange::new(8, 96);
/// Row distance between the members of a double-sided pair.
pub const AGG_INTRA_DISTANCE: usize = 2;
/// Row distance between consecutive groups in sequential mode.
pub const AGG_INTER_DISTANCE: ParamRange = ParamRange::new(1, 24);
/// Repetitions per group hit.
pub const AMPLITUDE: ParamRange = ParamRange::new(1, 6);
/// Aggressors per group.
pub const N_SIDED: ParamRange = ParamRange::new(1, 2);
/// Relative weight of each N-sidedness, starting at 1-sided.
pub const N_SIDED_PROBABILITIES: [u32; 2] = [2, 8];
/// First row of the window aggressors are placed in.
pub const START_ROW: ParamRange = ParamRange::new(0, 2048);
/// Height of the row window aggressors are placed in.
pub const ROW_WINDOW: usize = 1024;
/// Refresh intervals to wait (with random accesses) before hammering.
pub const WAIT_UNTIL_START_HAMMERING_REFS: ParamRange = ParamRange::new(10, 128);
/// Length of one refresh interval (tREFI) in microseconds.
pub const REF_INTERVAL_LEN_US: f64 = 7.8;

/// An inclusive integer range.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamRange {
    /// Lower bound
    pub min: usize,
    /// Upper bound (inclusive)
    pub max: usize,
}

impl ParamRange {
    /// Creates the range `min..=max`.
    pub const fn new(min: usize, max: usize) -> Self {
        ParamRange { min, max }
    }

    /// Draws a uniform value from the range. An inverted range yields `min`.
    pub fn sample(&self, rng: &mut Rng) -> usize {
        if self.max <= self.min {
            return self.min;
        }
        rng.random_range(self.min..=self.max)
    }
}

/// Where the kernel flushes an aggressor from the cache.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushingStrategy {
    /// Flush right after the access
    EarliestPossible,
    /// Flush right before the next access to the same address
    LatestPossible,
}

/// Where the kernel serializes memory accesses.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FencingStrategy {
    /// Fence right after each flush
    EarliestPossible,
    /// Fence periodically, right before an access
    LatestPossible,
    /// Never fence
    OmitFencing,
}

/// The combinations of flushing and fencing the fuzzer draws from.
pub const VALID_STRATEGIES: [(FlushingStrategy, FencingStrategy); 3] = [
    (
        FlushingStrategy::EarliestPossible,
        FencingStrategy::OmitFencing,
    ),
    (
        FlushingStrategy::EarliestPossible,
        FencingStrategy::LatestPossible,
    ),
    (
        FlushingStrategy::LatestPossible,
        FencingStrategy::LatestPossible,
    ),
];

/// Instruction emitted for explicit fence markers.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FenceType {
    /// Emit nothing
    NoFence,
    /// `mfence`
    #[default]
    Mfence,
    /// `lfence`
    Lfence,
    /// `sfence`
    Sfence,
}

/// Linearization of a pattern into the kernel's access sequence.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SchedulingPolicy {
    /// Generated order, no fences
    None,
    /// Generated order, one fence at the end
    #[default]
    Default,
    /// A fence after every access
    Full,
    /// A fence after every second access
    Pair,
    /// A fence after every base period
    BasePeriod,
    /// A fence after every half base period
    HalfBasePeriod,
    /// Least frequent group first inside each base period, fenced per base period
    Repetition,
}

/// Strategy choices fixed by the operator instead of drawn at random.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParameterOverrides {
    /// Fixed flushing strategy
    pub flushing: Option<FlushingStrategy>,
    /// Fixed fencing strategy
    pub fencing: Option<FencingStrategy>,
    /// Fixed fence type
    pub fence_type: Option<FenceType>,
    /// Fixed scheduling policy
    pub scheduling: Option<SchedulingPolicy>,
    /// Run patterns interleaved on one thread
    pub interleaved: bool,
}

/// Errors when drawing a parameter set.
#[derive(Debug, Error)]
pub enum ParamError {
    /// Activations per refresh interval must be positive
    #[error("activations per refresh interval must be positive")]
    NoActivations,
    /// The N-sidedness weights are unusable
    #[error(transparent)]
    Weights(#[from] rand::distr::weighted::Error),
}

/// The randomized knobs of one fuzzing run.
#[derive(Serialize, Debug, Clone)]
pub struct FuzzingParameterSet {
    /// Aggressor ids available to a pattern
    pub num_aggressors: usize,
    /// Row distance inside a double-sided pair
    pub agg_intra_distance: usize,
    /// Row distance between groups in sequential mode
    pub agg_inter_distance: usize,
    /// Range of group amplitudes
    pub amplitude: ParamRange,
    /// Range of group sizes
    pub n_sided: ParamRange,
    /// Weight per group size, starting at `n_sided.min`
    pub n_sided_probabilities: Vec<u32>,
    #[serde(skip)]
    n_sided_dist: WeightedIndex<u32>,
    /// Pattern length
    pub total_activations: usize,
    /// Activations the kernel performs
    pub hammering_activations: usize,
    /// Activations per refresh interval
    pub acts_per_trefi: usize,
    /// Refresh intervals per pattern
    pub num_refresh_intervals: usize,
    /// Base period in slots
    pub base_period: usize,
    /// Range of the first row of the placement window
    pub start_row: ParamRange,
    /// Height of the placement window
    pub row_window: usize,
    /// Place aggressors on consecutive rows instead of random ones
    pub use_sequential_aggressors: bool,
    /// Synchronize with refresh in every kernel iteration
    pub sync_each_ref: bool,
    /// Refresh intervals of random accesses before hammering
    pub wait_until_start_hammering_refs: usize,
    /// Run patterns interleaved on one thread
    pub interleaved: bool,
    /// Flushing strategy
    pub flushing: FlushingStrategy,
    /// Fencing strategy
    pub fencing: FencingStrategy,
    /// Instruction for fence markers
    pub fence_type: FenceType,
    /// Linearization policy
    pub scheduling: SchedulingPolicy,
}

impl FuzzingParameterSet {
    /// Draws a fresh parameter set.
    ///
    /// # Errors
    ///
    /// Returns an error if `acts_per_trefi` is zero.
    pub fn random(
        acts_per_trefi: usize,
        overrides: &ParameterOverrides,
        rng: &mut Rng,
    ) -> Result<Self, ParamError> {
        if acts_per_trefi == 0 {
            return Err(ParamError::NoActivations);
        }
        let num_refresh_intervals = 1_usize << rng.random_range(0..=4_u32);
        let base_period = get_random_even_divisor(acts_per_trefi, acts_per_trefi / 6, rng)
            .unwrap_or_else(|| {
                warn!(
                    "no even divisor of {} found, using base period 1",
                    acts_per_trefi
                );
                1
            });
        let (flushing, fencing) = strategy_pair(overrides, rng);
        let params = FuzzingParameterSet {
            num_aggressors: NUM_AGGRESSORS.sample(rng),
            agg_intra_distance: AGG_INTRA_DISTANCE,
            agg_inter_distance: AGG_INTER_DISTANCE.sample(rng),
            amplitude: AMPLITUDE,
            n_sided: N_SIDED,
            n_sided_probabilities: N_SIDED_PROBABILITIES.to_vec(),
            n_sided_dist: WeightedIndex::new(N_SIDED_PROBABILITIES)?,
            total_activations: acts_per_trefi * num_refresh_intervals,
            hammering_activations: HAMMERING_ACTIVATIONS,
            acts_per_trefi,
            num_refresh_intervals,
            base_period,
            start_row: START_ROW,
            row_window: ROW_WINDOW,
            use_sequential_aggressors: rng.random_bool(0.5),
            sync_each_ref: rng.random_bool(0.5),
            wait_until_start_hammering_refs: WAIT_UNTIL_START_HAMMERING_REFS.sample(rng),
            interleaved: overrides.interleaved,
            flushing,
            fencing,
            fence_type: overrides.fence_type.unwrap_or_default(),
            scheduling: overrides.scheduling.unwrap_or_default(),
        };
        debug!("{:?}", params);
        Ok(params)
    }

    /// Replaces the N-sidedness distribution.
    ///
    /// `probabilities[i]` is the weight of `n_sided.min + i` aggressors per group.
    ///
    /// # Errors
    ///
    /// Returns an error if the weights are empty or all zero.
    pub fn set_n_sided_distribution(
        &mut self,
        n_sided: ParamRange,
        probabilities: Vec<u32>,
    ) -> Result<(), ParamError> {
        self.n_sided_dist = WeightedIndex::new(&probabilities)?;
        self.n_sided = n_sided;
        self.n_sided_probabilities = probabilities;
        Ok(())
    }

    /// Draws an amplitude in `amplitude.min..=min(amplitude.max, max)`.
    pub fn random_amplitude(&self, max: usize, rng: &mut Rng) -> usize {
        ParamRange::new(self.amplitude.min, self.amplitude.max.min(max)).sample(rng)
    }

    /// Draws a group size from the N-sidedness distribution.
    pub fn random_n_sided(&self, rng: &mut Rng) -> usize {
        self.n_sided.min + self.n_sided_dist.sample(rng)
    }

    /// Draws a group size of at most `upper_bound`.
    pub fn random_n_sided_bounded(&self, upper_bound: usize, rng: &mut Rng) -> usize {
        if self.n_sided.max > upper_bound {
            return ParamRange::new(self.n_sided.min.min(upper_bound), upper_bound).sample(rng);
        }
        self.random_n_sided(rng)
    }

    /// Draws the first row of the placement window.
    pub fn random_start_row(&self, rng: &mut Rng) -> usize {
        self.start_row.sample(rng)
    }

    /// Time to spend on random accesses before hammering starts.
    pub fn wait_until_start_hammering(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(
            self.wait_until_start_hammering_refs as f64 * REF_INTERVAL_LEN_US / 1e6,
        )
    }

    /// Number of base periods in one pattern.
    pub fn num_base_periods(&self) -> usize {
        self.total_activations / self.base_period.max(1)
    }
}

fn strategy_pair(
    overrides: &ParameterOverrides,
    rng: &mut Rng,
) -> (FlushingStrategy, FencingStrategy) {
    if let (Some(flushing), Some(fencing)) = (overrides.flushing, overrides.fencing) {
        return (flushing, fencing);
    }
    let candidates = VALID_STRATEGIES
        .iter()
        .filter(|(fl, fe)| {
            overrides.flushing.is_none_or(|o| o == *fl) && overrides.fencing.is_none_or(|o| o == *fe)
        })
        .copied()
        .collect::<Vec<_>>();
    match candidates.choose(rng) {
        Some(&pair) => pair,
        None => {
            // the override has no valid partner, keep it and pick the other half at random
            let &(fl, fe) = VALID_STRATEGIES.choose(rng).unwrap_or(&VALID_STRATEGIES[0]);
            (
                overrides.flushing.unwrap_or(fl),
                overrides.fencing.unwrap_or(fe),
            )
        }
    }
}

/// Draws a random even divisor of `n` that is at least `min`.
///
/// Returns `None` if `n` has no such divisor.
pub fn get_random_even_divisor(n: usize, min: usize, rng: &mut Rng) -> Option<usize> {
    let mut divisors = (1..=n)
        .take_while(|i| i * i <= n)
        .filter(|i| n.is_multiple_of(*i))
        .flat_map(|i| [i, n / i])
        .filter(|d| d % 2 == 0 && *d >= min)
        .collect::<Vec<_>>();
    divisors.sort_unstable();
    divisors.dedup();
    divisors.shuffle(rng);
    divisors.first().copied()
}
