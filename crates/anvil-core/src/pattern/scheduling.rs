//! Linearization of a pattern into the kernel's access order.
//!
//! `None` entries in a schedule are fence markers.

use crate::pattern::{Aggressor, HammeringPattern, SchedulingPolicy};
use std::collections::HashSet;

impl SchedulingPolicy {
    /// Number of fence markers a schedule of `len` accesses receives.
    pub fn fence_count(&self, len: usize, base_period: usize) -> usize {
        let b = base_period.max(1);
        let gaps = len.saturating_sub(1);
        match self {
            SchedulingPolicy::None => 0,
            SchedulingPolicy::Default => usize::from(len > 0),
            SchedulingPolicy::Full => gaps,
            SchedulingPolicy::Pair => gaps / 2,
            SchedulingPolicy::BasePeriod | SchedulingPolicy::Repetition => gaps / b,
            SchedulingPolicy::HalfBasePeriod => gaps / (b / 2).max(1),
        }
    }

    /// Accesses between two fences, if the policy fences periodically.
    fn fence_every(&self, base_period: usize) -> Option<usize> {
        let b = base_period.max(1);
        match self {
            SchedulingPolicy::None | SchedulingPolicy::Default => None,
            SchedulingPolicy::Full => Some(1),
            SchedulingPolicy::Pair => Some(2),
            SchedulingPolicy::BasePeriod | SchedulingPolicy::Repetition => Some(b),
            SchedulingPolicy::HalfBasePeriod => Some((b / 2).max(1)),
        }
    }
}

/// Orders the accesses of `pattern` under `policy` and inserts fence markers.
pub fn schedule(pattern: &HammeringPattern, policy: SchedulingPolicy) -> Vec<Option<Aggressor>> {
    let base_period = pattern.base_period.max(1);
    let order = match policy {
        SchedulingPolicy::Repetition => repetition_order(pattern, base_period),
        _ => pattern.aggressors.clone(),
    };
    let len = order.len();
    let mut out = Vec::with_capacity(len + policy.fence_count(len, base_period));
    match policy.fence_every(base_period) {
        Some(every) => {
            for (i, agg) in order.into_iter().enumerate() {
                out.push(Some(agg));
                if (i + 1) % every == 0 && i + 1 < len {
                    out.push(None);
                }
            }
        }
        None => {
            out.extend(order.into_iter().map(Some));
            if policy == SchedulingPolicy::Default && len > 0 {
                out.push(None);
            }
        }
    }
    out
}

/// Within each base period window, accesses of the least frequent group come
/// first; the rest keep their generated order.
fn repetition_order(pattern: &HammeringPattern, base_period: usize) -> Vec<Aggressor> {
    let first = pattern
        .lowest_frequency_group()
        .map(|g| g.aggressors.iter().copied().collect::<HashSet<_>>())
        .unwrap_or_default();
    pattern
        .aggressors
        .chunks(base_period)
        .flat_map(|window| {
            let (front, back): (Vec<Aggressor>, Vec<Aggressor>) =
                window.iter().partition(|a| first.contains(*a));
            front.into_iter().chain(back)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::schedule;
    use crate::pattern::{Aggressor, AggressorAccessPattern, HammeringPattern, SchedulingPolicy};

    const POLICIES: [SchedulingPolicy; 7] = [
        SchedulingPolicy::None,
        SchedulingPolicy::Default,
        SchedulingPolicy::Full,
        SchedulingPolicy::Pair,
        SchedulingPolicy::BasePeriod,
        SchedulingPolicy::HalfBasePeriod,
        SchedulingPolicy::Repetition,
    ];

    fn pattern(len: usize, base_period: usize) -> HammeringPattern {
        let aggressors = (0..len).map(|i| Aggressor((i % 3) as u64)).collect::<Vec<_>>();
        HammeringPattern {
            id: "sched".into(),
            total_activations: len,
            aggressors,
            agg_access_patterns: vec![
                AggressorAccessPattern {
                    aggressors: vec![Aggressor(0), Aggressor(1)],
                    start_offset: 0,
                    frequency: 3,
                    amplitude: 1,
                },
                AggressorAccessPattern {
                    aggressors: vec![Aggressor(2)],
                    start_offset: 2,
                    frequency: 6,
                    amplitude: 1,
                },
            ],
            base_period,
            num_refresh_intervals: 1,
        }
    }

    #[test]
    fn test_fence_counts() {
        let p = pattern(10, 4);
        let counts = POLICIES
            .iter()
            .map(|policy| policy.fence_count(10, 4))
            .collect::<Vec<_>>();
        assert_eq!(counts, vec![0, 1, 9, 4, 2, 4, 2]);
        for policy in POLICIES {
            let scheduled = schedule(&p, policy);
            let fences = scheduled.iter().filter(|a| a.is_none()).count();
            assert_eq!(fences, policy.fence_count(10, 4), "{:?}", policy);
            assert_eq!(scheduled.len(), 10 + fences);
            assert_ne!(scheduled.first(), Some(&None));
        }
    }

    #[test]
    fn test_empty_pattern() {
        let p = pattern(0, 4);
        for policy in POLICIES {
            assert!(schedule(&p, policy).is_empty());
        }
    }

    #[test]
    fn test_half_base_period_of_one() {
        assert_eq!(SchedulingPolicy::HalfBasePeriod.fence_count(5, 1), 4);
        assert_eq!(SchedulingPolicy::BasePeriod.fence_count(5, 0), 4);
    }

    #[test]
    fn test_repetition_order() {
        let p = pattern(8, 4);
        let a = |i| Some(Aggressor(i));
        // windows [0 1 2 0] [1 2 0 1], group {2} moves to the front
        assert_eq!(
            schedule(&p, SchedulingPolicy::Repetition),
            vec![a(2), a(0), a(1), a(0), None, a(2), a(1), a(0), a(1)]
        );
    }

    #[test]
    fn test_default_and_pair() {
        let p = pattern(5, 4);
        let a = |i| Some(Aggressor(i));
        assert_eq!(
            schedule(&p, SchedulingPolicy::Default),
            vec![a(0), a(1), a(2), a(0), a(1), None]
        );
        assert_eq!(
            schedule(&p, SchedulingPolicy::Pair),
            vec![a(0), a(1), None, a(2), a(0), None, a(1)]
        );
    }
}
