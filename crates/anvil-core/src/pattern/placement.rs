use crate::pattern::{Aggressor, AggressorAccessPattern};
use log::trace;
use serde::Serialize;

/// Counters of one [`PlacementState::place`] call.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlacementOutcome {
    /// Hits that found their slots occupied
    pub collisions: usize,
    /// Hits written
    pub placed: usize,
}

/// Occupancy of one pattern block while groups are placed into it.
///
/// Groups are placed one at a time. Each call keeps its own working period
/// and backoff counter, so placing one group never affects how another one
/// is placed apart from the slots it occupies.
#[derive(Debug, Clone)]
pub struct PlacementState {
    slots: Vec<Option<Aggressor>>,
    collisions: usize,
    placed: usize,
}

impl PlacementState {
    /// An empty block of `len` slots.
    pub fn new(len: usize) -> Self {
        PlacementState {
            slots: vec![None; len],
            collisions: 0,
            placed: 0,
        }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if the block has no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of unoccupied slots.
    pub fn free_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.is_none()).count()
    }

    /// Collisions of all placements so far.
    pub fn collisions(&self) -> usize {
        self.collisions
    }

    /// Hits written by all placements so far.
    pub fn placed(&self) -> usize {
        self.placed
    }

    fn fits(&self, start: usize, len: usize) -> bool {
        start + len <= self.slots.len() && self.slots[start..start + len].iter().all(Option::is_none)
    }

    /// Places `group` every `distance` slots, starting at its offset.
    ///
    /// A hit needs `burst_len` consecutive free slots. After a collision the
    /// period shrinks by one (while it stays above 2) and the next attempt is
    /// the adjacent slot. Every later successful hit grows the period again
    /// by one until all collision-induced reductions are undone.
    pub fn place(&mut self, group: &AggressorAccessPattern, distance: f64) -> PlacementOutcome {
        let burst = group.burst().collect::<Vec<_>>();
        let mut outcome = PlacementOutcome::default();
        if burst.is_empty() {
            return outcome;
        }
        let len = self.slots.len() as f64;
        let mut distance = distance.max(1.0);
        let mut reductions = 0usize;
        let mut j = group.start_offset as f64;
        while j < len {
            let slot = j as usize;
            if !self.fits(slot, burst.len()) {
                if distance - 1.0 > 1.0 {
                    distance -= 1.0;
                }
                reductions += 1;
                outcome.collisions += 1;
                j += 1.0;
                continue;
            }
            if reductions > 0 {
                distance += 1.0;
                reductions -= 1;
            }
            for (k, agg) in burst.iter().enumerate() {
                self.slots[slot + k] = Some(*agg);
            }
            outcome.placed += 1;
            j += distance;
        }
        trace!(
            "placed group {} with {} hits, {} collisions",
            group, outcome.placed, outcome.collisions
        );
        self.collisions += outcome.collisions;
        self.placed += outcome.placed;
        outcome
    }

    /// Fills every free slot with the aggressors of `group` in rotation.
    ///
    /// Returns the number of slots filled.
    pub fn fill_gaps(&mut self, group: &AggressorAccessPattern) -> usize {
        if group.aggressors.is_empty() {
            return 0;
        }
        let mut rotation = group.aggressors.iter().copied().cycle();
        let mut filled = 0;
        for slot in self.slots.iter_mut().filter(|s| s.is_none()) {
            *slot = rotation.next();
            filled += 1;
        }
        filled
    }

    /// The block content. Free slots are reported as `None`.
    pub fn slots(&self) -> &[Option<Aggressor>] {
        &self.slots
    }

    /// The block as an access sequence, skipping free slots.
    pub fn into_sequence(self) -> Vec<Aggressor> {
        self.slots.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{PlacementOutcome, PlacementState};
    use crate::pattern::{Aggressor, AggressorAccessPattern};

    fn group(ids: &[u64], start_offset: usize, frequency: usize, amplitude: usize) -> AggressorAccessPattern {
        AggressorAccessPattern {
            aggressors: ids.iter().copied().map(Aggressor).collect(),
            start_offset,
            frequency,
            amplitude,
        }
    }

    #[test]
    fn test_place_without_collisions() {
        let mut state = PlacementState::new(12);
        let g = group(&[1, 2], 0, 4, 1);
        let outcome = state.place(&g, 4.0);
        assert_eq!(outcome, PlacementOutcome { collisions: 0, placed: 3 });
        let a = Some(Aggressor(1));
        let b = Some(Aggressor(2));
        assert_eq!(
            state.slots(),
            &[a, b, None, None, a, b, None, None, a, b, None, None]
        );
        assert_eq!(state.free_slots(), 6);
    }

    #[test]
    fn test_collision_backoff() {
        let mut state = PlacementState::new(10);
        state.place(&group(&[1], 0, 5, 1), 5.0);
        // second group wants slot 0 and 5, both taken
        let outcome = state.place(&group(&[2], 0, 5, 1), 5.0);
        // 0 collides -> distance 4, try 1 -> ok (distance back to 5) -> 6 ok
        assert_eq!(outcome, PlacementOutcome { collisions: 1, placed: 2 });
        let s = state.slots();
        assert_eq!(s[1], Some(Aggressor(2)));
        assert_eq!(s[6], Some(Aggressor(2)));
        assert_eq!(state.collisions(), 1);
        assert_eq!(state.placed(), 4);
    }

    #[test]
    fn test_burst_must_fit() {
        let mut state = PlacementState::new(5);
        let outcome = state.place(&group(&[1], 3, 10, 3), 10.0);
        // slots 3..6 exceed the block: collision at 3, then 4
        assert_eq!(outcome.placed, 0);
        assert_eq!(outcome.collisions, 2);
    }

    #[test]
    fn test_fill_gaps() {
        let mut state = PlacementState::new(6);
        state.place(&group(&[9], 0, 3, 1), 3.0);
        let filled = state.fill_gaps(&group(&[1, 2], 0, 2, 1));
        assert_eq!(filled, 4);
        assert_eq!(
            state.into_sequence(),
            [9, 1, 2, 9, 1, 2].into_iter().map(Aggressor).collect::<Vec<_>>()
        );
    }
}
