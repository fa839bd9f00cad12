use crate::hammerer::Access;
use crate::memory::{BitFlip, DRAMAddr, MemConfiguration};
use crate::pattern::{
    AddressSetBuilder, Aggressor, AggressorAccessPattern, FuzzingParameterSet, HammeringPattern,
    SchedulingPolicy, schedule,
};
use crate::util::Rng;
use log::{debug, trace};
use rand::RngCore;
use serde::Serialize;
use serde_with::serde_as;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::Range;
use thiserror::Error;

/// Rows on each side of an aggressor that are checked for flips.
pub const VICTIM_ROWS: usize = 5;

/// Errors when binding or moving aggressors.
#[derive(Debug, Error)]
pub enum MappingError {
    /// No valid candidate was found
    #[error("no valid address left in bank {bank}")]
    Exhausted {
        /// Bank that ran out of candidates
        bank: usize,
    },
    /// A shifted aggressor left the allocation or the row range
    #[error("shifting the mapping by {delta} rows leaves the usable range")]
    ShiftOutOfRange {
        /// Requested row offset
        delta: isize,
    },
    /// The pattern accesses an aggressor without an address
    #[error("aggressor {0} has no address")]
    UnknownAggressor(Aggressor),
}

/// Binds the aggressors of a pattern to DRAM addresses in one bank.
///
/// The mapping is randomized once per pattern and then shifted across
/// locations. Bit flips found with this mapping are recorded per run.
#[serde_as]
#[derive(Serialize, Debug, Clone)]
pub struct PatternAddressMapper {
    /// Mapping identifier
    pub id: String,
    /// Bank all aggressors live in
    pub bank: usize,
    #[serde_as(as = "Vec<(_, _)>")]
    aggressor_to_addr: HashMap<Aggressor, DRAMAddr>,
    rng: Rng,
    victim_rows: Vec<usize>,
    min_row: usize,
    max_row: usize,
    pattern_start_row: usize,
    bit_flips: Vec<Vec<BitFlip>>,
    #[serde(skip)]
    bounds: Range<usize>,
}

impl PatternAddressMapper {
    /// Creates an empty mapping for `bank` inside the allocation covering `bounds`.
    pub fn new(bank: usize, bounds: Range<usize>, mut rng: Rng) -> Self {
        PatternAddressMapper {
            id: format!("{:016x}", rng.next_u64()),
            bank,
            aggressor_to_addr: HashMap::new(),
            rng,
            victim_rows: vec![],
            min_row: 0,
            max_row: 0,
            pattern_start_row: 0,
            bit_flips: vec![],
            bounds,
        }
    }

    /// Binds every unbound aggressor of `groups` to an address in [`Self::bank`].
    ///
    /// Groups are walked in order. Inside a group, ids at even positions get
    /// a fresh row, either random inside the row window or the next free row
    /// in sequential mode. The id that follows is bound `agg_intra_distance`
    /// rows above it. With `avoid_duplicates` no address is bound twice.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::Exhausted`] if no valid candidate is found
    /// within [`crate::pattern::MAX_MAPPING_RETRIES`] attempts.
    pub fn randomize_addresses(
        &mut self,
        params: &FuzzingParameterSet,
        groups: &[AggressorAccessPattern],
        mem_config: &MemConfiguration,
        avoid_duplicates: bool,
    ) -> Result<(), MappingError> {
        let builder = AddressSetBuilder::new(mem_config, self.bounds.clone());
        let usable = builder.usable_rows();
        let start_row = params.random_start_row(&mut self.rng).min(usable.end.saturating_sub(1));
        let window = start_row..(start_row + params.row_window.max(1)).min(usable.end);
        let intra = params.agg_intra_distance as isize;
        let bank = self.bank;
        self.pattern_start_row = start_row;

        let mut bound = self.aggressor_to_addr.values().copied().collect::<HashSet<_>>();
        let mut cursor = start_row;
        for group in groups {
            for chunk in group.aggressors.chunks(2) {
                let first = chunk[0];
                let second = chunk.get(1).copied();
                let free = |a: &DRAMAddr| !avoid_duplicates || !bound.contains(a);
                let partner_free = |a: &DRAMAddr| {
                    second.is_none()
                        || a.checked_add(0, intra, 0, mem_config)
                            .is_some_and(|p| builder.is_valid(&p) && free(&p))
                };

                let first_addr = match self.aggressor_to_addr.get(&first) {
                    Some(addr) => *addr,
                    None if params.use_sequential_aggressors => builder
                        .sequential_address(bank, cursor, |a| free(a) && partner_free(a))
                        .ok_or(MappingError::Exhausted { bank })?,
                    None if second.is_some() => builder
                        .random_pair(bank, window.clone(), intra as usize, &mut self.rng, free)
                        .map(|(a, _)| a)
                        .ok_or(MappingError::Exhausted { bank })?,
                    None => builder
                        .random_address(bank, window.clone(), &mut self.rng, free)
                        .ok_or(MappingError::Exhausted { bank })?,
                };
                bound.insert(first_addr);
                self.aggressor_to_addr.insert(first, first_addr);
                let mut last_row = first_addr.row;

                if let Some(second) = second
                    && !self.aggressor_to_addr.contains_key(&second)
                {
                    let unbound = |a: &DRAMAddr| !avoid_duplicates || !bound.contains(a);
                    // a rebound first id may have its partner slot taken
                    let addr = match first_addr
                        .checked_add(0, intra, 0, mem_config)
                        .filter(|a| builder.is_valid(a) && unbound(a))
                    {
                        Some(addr) => addr,
                        None => builder
                            .random_address(bank, window.clone(), &mut self.rng, unbound)
                            .ok_or(MappingError::Exhausted { bank })?,
                    };
                    bound.insert(addr);
                    self.aggressor_to_addr.insert(second, addr);
                    last_row = addr.row;
                }
                cursor = last_row + params.agg_inter_distance.max(1);
            }
        }
        self.update_rows(mem_config);
        debug!(
            "mapping {}: {} aggressors in bank {}, rows {}..={}",
            self.id,
            self.aggressor_to_addr.len(),
            self.bank,
            self.min_row,
            self.max_row
        );
        Ok(())
    }

    fn update_rows(&mut self, mem_config: &MemConfiguration) {
        let rows = self
            .aggressor_to_addr
            .values()
            .map(|a| a.row)
            .collect::<BTreeSet<_>>();
        self.min_row = rows.first().copied().unwrap_or(0);
        self.max_row = rows.last().copied().unwrap_or(0);
        let row_count = mem_config.get_row_count();
        self.victim_rows = rows
            .iter()
            .flat_map(|&r| r.saturating_sub(VICTIM_ROWS)..=(r + VICTIM_ROWS).min(row_count - 1))
            .filter(|r| !rows.contains(r))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
    }

    /// Translates `pattern` into the kernel's access sequence under `policy`.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::UnknownAggressor`] if the pattern accesses an
    /// aggressor this mapping has not bound.
    pub fn export_pattern(
        &self,
        pattern: &HammeringPattern,
        policy: SchedulingPolicy,
        mem_config: &MemConfiguration,
    ) -> Result<Vec<Access>, MappingError> {
        let base = self.bounds.start as *const u8;
        schedule(pattern, policy)
            .into_iter()
            .map(|slot| match slot {
                Some(agg) => self
                    .aggressor_to_addr
                    .get(&agg)
                    .map(|addr| Access::Row(addr.to_virt(base, mem_config) as usize))
                    .ok_or(MappingError::UnknownAggressor(agg)),
                None => Ok(Access::Fence),
            })
            .collect()
    }

    /// Moves every aggressor not in `excluded` by `delta` rows.
    ///
    /// Either all aggressors move or none does.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::ShiftOutOfRange`] if a moved aggressor would
    /// wrap, enter the sync reserve or leave the allocation.
    pub fn shift_mapping(
        &mut self,
        delta: isize,
        excluded: &HashSet<Aggressor>,
        mem_config: &MemConfiguration,
    ) -> Result<(), MappingError> {
        let builder = AddressSetBuilder::new(mem_config, self.bounds.clone());
        let mut shifted = self.aggressor_to_addr.clone();
        for (agg, addr) in shifted.iter_mut() {
            if excluded.contains(agg) {
                continue;
            }
            *addr = addr
                .checked_add(0, delta, 0, mem_config)
                .filter(|a| builder.is_valid(a))
                .ok_or(MappingError::ShiftOutOfRange { delta })?;
        }
        self.aggressor_to_addr = shifted;
        self.pattern_start_row = self.pattern_start_row.saturating_add_signed(delta);
        self.update_rows(mem_config);
        trace!("mapping {} shifted by {} rows", self.id, delta);
        Ok(())
    }

    /// Virtual addresses of up to `count` rows of this bank that the pattern
    /// never accesses.
    ///
    /// Rows above the highest aggressor are preferred; rows below the lowest
    /// one are used when the bank runs out.
    pub fn sync_rows(&self, count: usize, mem_config: &MemConfiguration) -> Vec<usize> {
        let builder = AddressSetBuilder::new(mem_config, self.bounds.clone());
        let usable = builder.usable_rows();
        let above = (self.max_row + VICTIM_ROWS + 1)..usable.end;
        let below = (0..self.min_row.saturating_sub(VICTIM_ROWS)).rev();
        above
            .chain(below)
            .map(|row| DRAMAddr::new(self.bank, row, 0))
            .filter(|a| builder.is_valid(a))
            .map(|a| builder.to_virt(&a))
            .take(count)
            .collect()
    }

    /// Merges exported sequences into one, round-robin.
    ///
    /// Each turn takes the next `distance` accesses of a sequence (2 for
    /// every sequence but the first if `single_pair_only`) and appends a
    /// fence. Exhausted sequences are skipped.
    pub fn interleave(exported: &[Vec<Access>], single_pair_only: bool, distance: usize) -> Vec<Access> {
        let mut cursors = vec![0; exported.len()];
        let mut out = Vec::with_capacity(exported.iter().map(|e| e.len() + e.len() / 2 + 1).sum());
        loop {
            let mut progressed = false;
            for (i, seq) in exported.iter().enumerate() {
                let take = if single_pair_only && i > 0 { 2 } else { distance.max(1) };
                let start = cursors[i];
                if start >= seq.len() {
                    continue;
                }
                let end = (start + take).min(seq.len());
                out.extend_from_slice(&seq[start..end]);
                out.push(Access::Fence);
                cursors[i] = end;
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
        out
    }

    /// Address of `agg`.
    pub fn get(&self, agg: &Aggressor) -> Option<&DRAMAddr> {
        self.aggressor_to_addr.get(agg)
    }

    /// Bound aggressors with their addresses, ordered by aggressor.
    pub fn aggressors(&self) -> Vec<(Aggressor, DRAMAddr)> {
        let mut v = self
            .aggressor_to_addr
            .iter()
            .map(|(a, d)| (*a, *d))
            .collect::<Vec<_>>();
        v.sort_unstable();
        v
    }

    /// Number of bound aggressors.
    pub fn len(&self) -> usize {
        self.aggressor_to_addr.len()
    }

    /// Returns true if nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.aggressor_to_addr.is_empty()
    }

    /// Rows next to aggressors that are not aggressors themselves.
    pub fn victim_rows(&self) -> &[usize] {
        &self.victim_rows
    }

    /// Lowest aggressor row.
    pub fn min_row(&self) -> usize {
        self.min_row
    }

    /// Highest aggressor row.
    pub fn max_row(&self) -> usize {
        self.max_row
    }

    /// First row of the window the mapping was drawn from.
    pub fn pattern_start_row(&self) -> usize {
        self.pattern_start_row
    }

    /// Allocation this mapping is bound to.
    pub fn bounds(&self) -> Range<usize> {
        self.bounds.clone()
    }

    /// Records the flips of one run.
    pub fn add_bit_flips(&mut self, flips: Vec<BitFlip>) {
        self.bit_flips.push(flips);
    }

    /// Forgets the flip history, e.g. before the mapping is replayed.
    pub fn clear_bit_flips(&mut self) {
        self.bit_flips.clear();
    }

    /// Flips of all runs.
    pub fn bit_flips(&self) -> &[Vec<BitFlip>] {
        &self.bit_flips
    }

    /// Returns true if a flip at `addr` with `bitmask` was recorded before.
    pub fn has_flip(&self, addr: usize, bitmask: u8) -> bool {
        self.bit_flips
            .iter()
            .flatten()
            .any(|f| f.addr == addr && f.bitmask == bitmask)
    }

    /// Total number of recorded flips.
    pub fn count_bitflips(&self) -> usize {
        self.bit_flips.iter().map(|b| b.len()).sum()
    }
}
