use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Abstract aggressor identifier.
///
/// An aggressor only names a slot in a pattern; the concrete row it hammers
/// is chosen later by a [`crate::pattern::PatternAddressMapper`].
#[derive(
    Serialize, Deserialize, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default,
)]
pub struct Aggressor(pub u64);

impl Display for Aggressor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "A{}", self.0)
    }
}

/// A group of aggressors hammered together.
///
/// Every `frequency` slots, starting at `start_offset`, the aggressors are
/// accessed back to back, repeated `amplitude` times.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AggressorAccessPattern {
    /// Aggressors of this group, in access order
    pub aggressors: Vec<Aggressor>,
    /// First slot of the group in the pattern
    pub start_offset: usize,
    /// Period in slots
    pub frequency: usize,
    /// Number of consecutive repetitions per hit
    pub amplitude: usize,
}

impl AggressorAccessPattern {
    /// Number of consecutive slots one hit of this group occupies.
    pub fn burst_len(&self) -> usize {
        self.amplitude * self.aggressors.len()
    }

    /// The accesses of one hit: all aggressors, `amplitude` times.
    pub fn burst(&self) -> impl Iterator<Item = Aggressor> + '_ {
        (0..self.amplitude).flat_map(move |_| self.aggressors.iter().copied())
    }

    /// Returns true if `agg` belongs to this group.
    pub fn contains(&self, agg: &Aggressor) -> bool {
        self.aggressors.contains(agg)
    }
}

impl Display for AggressorAccessPattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-sided @ offset {}, period {}, amplitude {}",
            self.aggressors.len(),
            self.start_offset,
            self.frequency,
            self.amplitude
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{Aggressor, AggressorAccessPattern};

    #[test]
    fn test_burst() {
        let group = AggressorAccessPattern {
            aggressors: vec![Aggressor(1), Aggressor(2)],
            start_offset: 0,
            frequency: 8,
            amplitude: 2,
        };
        assert_eq!(group.burst_len(), 4);
        assert_eq!(
            group.burst().collect::<Vec<_>>(),
            vec![Aggressor(1), Aggressor(2), Aggressor(1), Aggressor(2)]
        );
        assert!(group.contains(&Aggressor(2)));
        assert!(!group.contains(&Aggressor(3)));
    }
}
