use crate::pattern::{
    Aggressor, AggressorAccessPattern, FuzzingParameterSet, HammeringPattern, PatternGenerator,
};
use crate::util::Rng;
use rand::RngCore;

/// Number of groups in a simple pattern.
pub const SIMPLE_GROUPS: usize = 4;

/// Generates patterns from a fixed number of groups hammered round-robin.
///
/// The burst of group 0 is followed by the burst of group 1 and so on; the
/// cycle repeats until the pattern is full.
#[derive(Debug, Clone, Copy)]
pub struct SimplePatternBuilder<'a> {
    params: &'a FuzzingParameterSet,
}

impl<'a> SimplePatternBuilder<'a> {
    /// Creates a builder for `params`.
    pub fn new(params: &'a FuzzingParameterSet) -> Self {
        SimplePatternBuilder { params }
    }

    /// Generates a pattern.
    pub fn build(&self, rng: &mut Rng) -> HammeringPattern {
        let id = format!("{:016x}", rng.next_u64());
        let mut next_id = 0u64;
        let mut offset = 0;
        let mut groups = Vec::with_capacity(SIMPLE_GROUPS);
        for _ in 0..SIMPLE_GROUPS {
            let n = self.params.random_n_sided(rng);
            let amplitude = self.params.random_amplitude(self.params.amplitude.max, rng);
            let group = AggressorAccessPattern {
                aggressors: (next_id..next_id + n as u64).map(Aggressor).collect(),
                start_offset: offset,
                frequency: 0,
                amplitude,
            };
            next_id += n as u64;
            offset += group.burst_len();
            groups.push(group);
        }
        let cycle_len = offset;
        for group in &mut groups {
            group.frequency = cycle_len;
        }

        let total = self.params.total_activations;
        let aggressors = groups
            .iter()
            .flat_map(|g| g.burst())
            .collect::<Vec<_>>()
            .into_iter()
            .cycle()
            .take(total)
            .collect::<Vec<_>>();
        HammeringPattern {
            id,
            total_activations: aggressors.len(),
            aggressors,
            agg_access_patterns: groups,
            base_period: self.params.base_period,
            num_refresh_intervals: self.params.num_refresh_intervals,
        }
    }
}

impl PatternGenerator for SimplePatternBuilder<'_> {
    fn generate(&self, rng: &mut Rng) -> HammeringPattern {
        self.build(rng)
    }
}

#[cfg(test)]
mod tests {
    use super::{SIMPLE_GROUPS, SimplePatternBuilder};
    use crate::pattern::{Aggressor, FuzzingParameterSet, ParameterOverrides};
    use crate::util::Rng;

    fn params() -> FuzzingParameterSet {
        FuzzingParameterSet::random(76, &ParameterOverrides::default(), &mut Rng::from_seed(4))
            .expect("params")
    }

    #[test]
    fn test_round_robin() {
        let params = params();
        let pattern = SimplePatternBuilder::new(&params).build(&mut Rng::from_seed(8));
        assert_eq!(pattern.agg_access_patterns.len(), SIMPLE_GROUPS);
        assert_eq!(pattern.aggressors.len(), params.total_activations);

        let cycle_len = pattern.agg_access_patterns[0].frequency;
        let mut expected_offset = 0;
        for group in &pattern.agg_access_patterns {
            assert_eq!(group.frequency, cycle_len);
            assert_eq!(group.start_offset, expected_offset);
            if group.start_offset < pattern.aggressors.len() {
                assert_eq!(pattern.aggressors[group.start_offset], group.aggressors[0]);
            }
            expected_offset += group.burst_len();
        }
        assert_eq!(expected_offset, cycle_len);
        for (i, agg) in pattern.aggressors.iter().enumerate().skip(cycle_len) {
            assert_eq!(*agg, pattern.aggressors[i - cycle_len]);
        }
        // ids are fresh and sequential
        let last = pattern.agg_access_patterns.last().expect("groups");
        let max_id = last.aggressors.last().expect("ids").0;
        let total_ids: usize = pattern.agg_access_patterns.iter().map(|g| g.aggressors.len()).sum();
        assert_eq!(max_id as usize + 1, total_ids);
        assert_eq!(pattern.agg_access_patterns[0].aggressors[0], Aggressor(0));
    }

    #[test]
    fn test_deterministic() {
        let params = params();
        let builder = SimplePatternBuilder::new(&params);
        assert_eq!(
            builder.build(&mut Rng::from_seed(1)),
            builder.build(&mut Rng::from_seed(1))
        );
    }
}
