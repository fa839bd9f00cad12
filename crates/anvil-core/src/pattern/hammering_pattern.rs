use crate::pattern::{Aggressor, AggressorAccessPattern};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// An address-independent hammering pattern.
///
/// `aggressors` is the flat access sequence, exactly `total_activations`
/// long. `agg_access_patterns` keeps the group structure the sequence was
/// generated from. Patterns are immutable once generated; mapping them to
/// addresses happens in [`crate::pattern::PatternAddressMapper`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HammeringPattern {
    /// Pattern identifier
    pub id: String,
    /// Flat access sequence
    pub aggressors: Vec<Aggressor>,
    /// Groups the sequence was built from
    pub agg_access_patterns: Vec<AggressorAccessPattern>,
    /// Base period in slots
    pub base_period: usize,
    /// Length of the access sequence
    pub total_activations: usize,
    /// Number of refresh intervals the sequence spans
    pub num_refresh_intervals: usize,
}

impl HammeringPattern {
    /// Distinct aggressors in order of first access.
    pub fn unique_aggressors(&self) -> Vec<Aggressor> {
        self.aggressors.iter().copied().unique().collect()
    }

    /// The group `agg` belongs to.
    pub fn group_of(&self, agg: &Aggressor) -> Option<&AggressorAccessPattern> {
        self.agg_access_patterns.iter().find(|g| g.contains(agg))
    }

    /// The group with the largest period, i.e. the least frequently accessed one.
    pub fn lowest_frequency_group(&self) -> Option<&AggressorAccessPattern> {
        self.agg_access_patterns
            .iter()
            .rev()
            .max_by_key(|g| g.frequency)
    }
}

#[cfg(test)]
mod tests {
    use super::HammeringPattern;
    use crate::pattern::{Aggressor, AggressorAccessPattern};

    fn group(ids: &[u64], frequency: usize) -> AggressorAccessPattern {
        AggressorAccessPattern {
            aggressors: ids.iter().copied().map(Aggressor).collect(),
            start_offset: 0,
            frequency,
            amplitude: 1,
        }
    }

    #[test]
    fn test_queries() {
        let pattern = HammeringPattern {
            id: "p".into(),
            aggressors: [0, 1, 2, 0, 1, 3].into_iter().map(Aggressor).collect(),
            agg_access_patterns: vec![group(&[0, 1], 3), group(&[2], 6), group(&[3], 6)],
            base_period: 3,
            total_activations: 6,
            num_refresh_intervals: 1,
        };
        assert_eq!(
            pattern.unique_aggressors(),
            vec![Aggressor(0), Aggressor(1), Aggressor(2), Aggressor(3)]
        );
        assert_eq!(pattern.group_of(&Aggressor(1)).map(|g| g.frequency), Some(3));
        assert!(pattern.group_of(&Aggressor(9)).is_none());
        // ties resolve to the first group
        assert_eq!(
            pattern.lowest_frequency_group().map(|g| g.aggressors[0]),
            Some(Aggressor(2))
        );
    }
}
