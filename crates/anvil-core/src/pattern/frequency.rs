//! Frequency-domain pattern generation.
//!
//! A block of slots is filled with aggressor groups, each hammered at its own
//! period with its own phase and amplitude. The block is then repeated until
//! the pattern reaches its target length.

use crate::pattern::{
    Aggressor, AggressorAccessPattern, FuzzingParameterSet, HammeringPattern, PatternGenerator,
    PlacementState,
};
use crate::util::Rng;
use log::debug;
use rand::{Rng as _, RngCore};
use serde::Serialize;

/// Smallest block the generator draws.
pub const MIN_SLOTS: usize = 20;

/// Placement counters of one generated pattern.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlacementStats {
    /// Slots in one block
    pub block_len: usize,
    /// Groups placed into the block
    pub groups: usize,
    /// Collisions over all groups
    pub collisions: usize,
    /// Hits placed over all groups
    pub placed: usize,
    /// Free slots filled after placement
    pub filled: usize,
}

/// Generates patterns by frequency-based constrained random search.
#[derive(Debug, Clone, Copy)]
pub struct FrequencyPatternBuilder<'a> {
    params: &'a FuzzingParameterSet,
}

impl<'a> FrequencyPatternBuilder<'a> {
    /// Creates a builder for `params`.
    pub fn new(params: &'a FuzzingParameterSet) -> Self {
        FrequencyPatternBuilder { params }
    }

    /// Generates a pattern.
    pub fn build(&self, rng: &mut Rng) -> HammeringPattern {
        self.build_with_stats(rng).0
    }

    /// Generates a pattern and reports how placement went.
    pub fn build_with_stats(&self, rng: &mut Rng) -> (HammeringPattern, PlacementStats) {
        let id = format!("{:016x}", rng.next_u64());
        let slots = self.block_len(rng);
        let groups = self.draw_groups(slots, rng);
        self.assemble(id, groups, slots)
    }

    /// Builds a pattern from fixed groups, each placed at its own `frequency`.
    pub fn build_with_groups(
        &self,
        groups: Vec<AggressorAccessPattern>,
        block_len: usize,
        rng: &mut Rng,
    ) -> (HammeringPattern, PlacementStats) {
        let id = format!("{:016x}", rng.next_u64());
        let groups = groups
            .into_iter()
            .map(|g| {
                let distance = g.frequency as f64;
                (g, distance)
            })
            .collect();
        self.assemble(id, groups, block_len.max(1))
    }

    fn block_len(&self, rng: &mut Rng) -> usize {
        let total = self.params.total_activations.max(1);
        let upper = (self.params.acts_per_trefi * self.params.num_refresh_intervals).max(1);
        let lower = self.params.base_period.clamp(1, upper);
        let slots = rng.random_range(lower..=upper);
        slots.clamp(MIN_SLOTS.min(total), total)
    }

    fn draw_groups(&self, slots: usize, rng: &mut Rng) -> Vec<(AggressorAccessPattern, f64)> {
        let params = self.params;
        let max_distance = (slots as f64 / 10.0).max(2.0);
        let mut budget = slots as f64;
        let mut next_id = 0;
        let mut groups = vec![];
        while next_id < params.num_aggressors {
            let distance = rng.random_range(1.5..max_distance);
            let offset = rng.random_range(0.0..=0.75 * slots as f64) as usize;
            let start_offset = if offset > slots / 3 { offset } else { 0 };
            let n = params.random_n_sided_bounded(params.num_aggressors - next_id, rng);
            let amplitude = params.random_amplitude((slots / n.max(1)).max(1), rng);
            let group = AggressorAccessPattern {
                aggressors: (next_id..next_id + n).map(|i| Aggressor(i as u64)).collect(),
                start_offset,
                frequency: (distance.round() as usize).max(1),
                amplitude,
            };
            next_id += n;
            budget -= slots as f64 / distance * group.burst_len() as f64;
            groups.push((group, distance));
            if budget <= 0.0 {
                break;
            }
        }
        groups
    }

    fn assemble(
        &self,
        id: String,
        groups: Vec<(AggressorAccessPattern, f64)>,
        slots: usize,
    ) -> (HammeringPattern, PlacementStats) {
        let mut state = PlacementState::new(slots);
        for (group, distance) in &groups {
            state.place(group, *distance);
        }
        let groups = groups.into_iter().map(|(g, _)| g).collect::<Vec<_>>();
        // highest frequency = shortest period
        let filled = match groups.iter().min_by_key(|g| g.frequency) {
            Some(g) => state.fill_gaps(g),
            None => 0,
        };
        let stats = PlacementStats {
            block_len: slots,
            groups: groups.len(),
            collisions: state.collisions(),
            placed: state.placed(),
            filled,
        };
        let block = state.into_sequence();
        let total = self.params.total_activations;
        let aggressors = block.iter().copied().cycle().take(total).collect::<Vec<_>>();
        debug!(
            "pattern {}: {} groups in {} slots, {} collisions, {} gaps filled",
            id, stats.groups, slots, stats.collisions, stats.filled
        );
        let pattern = HammeringPattern {
            id,
            total_activations: aggressors.len(),
            aggressors,
            agg_access_patterns: groups,
            base_period: self.params.base_period,
            num_refresh_intervals: self.params.num_refresh_intervals,
        };
        (pattern, stats)
    }
}

impl PatternGenerator for FrequencyPatternBuilder<'_> {
    fn generate(&self, rng: &mut Rng) -> HammeringPattern {
        self.build(rng)
    }
}

#[cfg(test)]
mod tests {
    use super::{FrequencyPatternBuilder, MIN_SLOTS};
    use crate::pattern::{Aggressor, AggressorAccessPattern, FuzzingParameterSet, ParameterOverrides};
    use crate::util::Rng;
    use std::collections::HashSet;

    fn params(seed: u64) -> FuzzingParameterSet {
        FuzzingParameterSet::random(76, &ParameterOverrides::default(), &mut Rng::from_seed(seed))
            .expect("params")
    }

    #[test]
    fn test_deterministic() {
        let params = params(11);
        let builder = FrequencyPatternBuilder::new(&params);
        let a = builder.build(&mut Rng::from_seed(99));
        let b = builder.build(&mut Rng::from_seed(99));
        assert_eq!(a, b);
        let c = builder.build(&mut Rng::from_seed(100));
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_pattern_shape() {
        for seed in 0..20 {
            let params = params(seed);
            let builder = FrequencyPatternBuilder::new(&params);
            let (pattern, stats) = builder.build_with_stats(&mut Rng::from_seed(seed));
            assert_eq!(pattern.aggressors.len(), params.total_activations);
            assert_eq!(pattern.total_activations, params.total_activations);
            assert!(stats.block_len >= MIN_SLOTS.min(params.total_activations));
            assert!(stats.block_len <= params.total_activations);
            assert!(!pattern.agg_access_patterns.is_empty());

            let ids = pattern
                .agg_access_patterns
                .iter()
                .flat_map(|g| g.aggressors.iter().copied())
                .collect::<Vec<_>>();
            let unique = ids.iter().copied().collect::<HashSet<_>>();
            assert_eq!(ids.len(), unique.len(), "ids are fresh per group");
            assert!(unique.len() <= params.num_aggressors);
            for agg in pattern.unique_aggressors() {
                assert!(unique.contains(&agg));
            }
        }
    }

    #[test]
    fn test_fixed_groups() {
        let mut params = params(5);
        params.total_activations = 100;
        let groups = vec![
            AggressorAccessPattern {
                aggressors: vec![Aggressor(0), Aggressor(1)],
                start_offset: 0,
                frequency: 4,
                amplitude: 1,
            },
            AggressorAccessPattern {
                aggressors: vec![Aggressor(2)],
                start_offset: 2,
                frequency: 8,
                amplitude: 1,
            },
        ];
        let builder = FrequencyPatternBuilder::new(&params);
        let (pattern, stats) = builder.build_with_groups(groups, 20, &mut Rng::from_seed(1));
        assert_eq!(stats.collisions, 0);
        assert_eq!(stats.placed, 5 + 3);
        assert_eq!(stats.filled, 20 - 10 - 3);
        assert_eq!(pattern.aggressors.len(), 100);
        assert_eq!(&pattern.aggressors[..4], &[Aggressor(0), Aggressor(1), Aggressor(2), Aggressor(0)]);
        // block repeats every 20 slots
        assert_eq!(pattern.aggressors[..20], pattern.aggressors[20..40]);
    }
}
