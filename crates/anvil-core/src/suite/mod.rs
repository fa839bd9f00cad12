//! The fuzzing suite.
//!
//! [`HammerSuite`] drives the pipeline for one allocation: it draws parameters,
//! generates and maps one pattern per thread, hammers them concurrently (or
//! interleaved on one thread), verifies the victim rows and collects
//! [`FuzzReport`]s. It owns every piece of mutable run state, so two suites
//! never share a bank counter or a random stream.

mod report;
mod threads;

pub use self::report::{
    BankStats, DroppedPattern, FlipAnalysis, FlipRecord, FuzzReport, LocationReport,
    MAX_ANALYZED_THREADS, PatternReport, ThreadStats, analyze_flips, flip_records,
};
pub use self::threads::{WARMUP_READS, WARMUP_ROWS};

use self::threads::{HammerJob, HammerTiming, cpu_count};
use crate::hammerer::{Access, AccessLoop, HammerKernel};
use crate::memory::{AccessTimer, BitFlip, DramConfig, MemCheck, Memory, RefreshTimer};
use crate::pattern::{
    FencingStrategy, FenceType, FlushingStrategy, FrequencyPatternBuilder, FuzzingParameterSet,
    HammeringPattern, MappingError, ParamError, ParameterOverrides, PatternAddressMapper,
    PatternGenerator, SchedulingPolicy, SimplePatternBuilder,
};
use crate::util::{NamedProgress, Rng};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use itertools::Itertools;
use log::{debug, error, info, warn};
use rand::Rng as _;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Barrier;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Largest row offset between two locations.
pub const MAX_SHIFT_ROWS: usize = 64;
/// Locations per pattern set in the random sweep.
pub const SWEEP_LOCATIONS: usize = 3;
/// Largest thread count of the random sweep.
pub const MAX_SWEEP_THREADS: usize = 8;
/// Largest number of effective patterns combined in the combined sweep.
pub const MAX_COMBINED_PATTERNS: usize = 6;

/// Run configuration of a [`HammerSuite`].
#[derive(Serialize, Debug, Clone)]
pub struct SuiteConfig {
    /// Budget for [`HammerSuite::auto_fuzz`], checked between runs
    pub runtime: Duration,
    /// Locations per run
    pub locations: usize,
    /// Patterns hammered concurrently
    pub threads: usize,
    /// Seed of the suite's random stream
    pub seed: u64,
    /// Interleave all patterns on one thread instead of one thread each
    pub interleaved: bool,
    /// Accesses taken from a sequence per interleaving turn
    pub interleave_distance: usize,
    /// Take only one pair per turn from every sequence but the first
    pub interleave_single_pair_only: bool,
    /// Use the simple generator for the first pattern
    pub simple_first: bool,
    /// Use the simple generator for all other patterns
    pub simple_other: bool,
    /// Draw fresh parameters for every pattern of a run
    pub randomize_each: bool,
    /// Fixed flushing strategy
    pub flushing: Option<FlushingStrategy>,
    /// Fixed fencing strategy
    pub fencing: Option<FencingStrategy>,
    /// Fixed fence instruction
    pub fence_type: Option<FenceType>,
    /// Fixed scheduling policy
    pub scheduling: Option<SchedulingPolicy>,
    /// Fixed number of activations per kernel run
    pub hammering_activations: Option<usize>,
    /// CPU of the first hammering thread
    pub thread_start_id: usize,
    /// Replay effective patterns with 1 to 8 threads after fuzzing
    pub fuzz_random: bool,
    /// Replay combinations of effective patterns after fuzzing
    pub fuzz_combined: bool,
    /// Leave flips in memory and count each one only once per mapping
    pub reproducibility_mode: bool,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            runtime: Duration::from_secs(120),
            locations: 3,
            threads: 1,
            seed: 0,
            interleaved: false,
            interleave_distance: 2,
            interleave_single_pair_only: false,
            simple_first: false,
            simple_other: false,
            randomize_each: false,
            flushing: None,
            fencing: None,
            fence_type: None,
            scheduling: None,
            hammering_activations: None,
            thread_start_id: 0,
            fuzz_random: false,
            fuzz_combined: false,
            reproducibility_mode: false,
        }
    }
}

impl SuiteConfig {
    /// Parameter choices fixed by this configuration.
    pub fn overrides(&self) -> ParameterOverrides {
        ParameterOverrides {
            flushing: self.flushing,
            fencing: self.fencing,
            fence_type: self.fence_type,
            scheduling: self.scheduling,
            interleaved: self.interleaved,
        }
    }
}

/// A pattern together with its mapping and the parameters it was drawn from.
#[derive(Serialize, Debug, Clone)]
pub struct MappedPattern {
    /// The address-independent pattern
    pub pattern: HammeringPattern,
    /// Its binding to one bank
    pub mapper: PatternAddressMapper,
    /// Parameters used for generation and mapping
    pub params: FuzzingParameterSet,
}

impl MappedPattern {
    /// Pattern identifier.
    pub fn id(&self) -> &str {
        &self.pattern.id
    }
}

/// Round-robin bank assignment.
#[derive(Serialize, Debug, Clone, Copy)]
pub struct BankCounter {
    next: usize,
    banks: usize,
}

impl BankCounter {
    /// Starts at bank 0 of `banks`.
    pub fn new(banks: usize) -> Self {
        BankCounter {
            next: 0,
            banks: banks.max(1),
        }
    }

    /// Returns the current bank and advances.
    pub fn next_bank(&mut self) -> usize {
        let bank = self.next;
        self.next = (self.next + 1) % self.banks;
        bank
    }
}

/// Errors that end a fuzzing run.
#[derive(Debug, Error)]
pub enum SuiteError {
    /// Activations per refresh interval are unknown
    #[error("refresh timing is not calibrated")]
    NotCalibrated,
    /// A run needs at least one location
    #[error("at least one location is required")]
    NoLocations,
    /// Parameter drawing failed
    #[error(transparent)]
    Params(#[from] ParamError),
}

/// Reports of the effective-pattern sweep.
#[derive(Serialize, Debug, Clone, Default)]
pub struct EffectiveSweep {
    /// Analysis of the reports the sweep started from
    pub analysis: FlipAnalysis,
    /// Effective patterns replayed with 1 to 8 threads
    pub random: Vec<FuzzReport>,
    /// Combinations of effective patterns on distinct banks
    pub combined: Vec<FuzzReport>,
}

/// Everything [`HammerSuite::auto_fuzz`] produced.
#[derive(Serialize, Debug, Clone, Default)]
pub struct AutoFuzzReport {
    /// One report per fuzz run
    pub runs: Vec<FuzzReport>,
    /// The sweep, if requested
    pub sweep: Option<EffectiveSweep>,
}

/// Fuzzing driver for one allocation.
///
/// # Type Parameters
///
/// * `T` - Timer used for refresh synchronization
/// * `K` - Kernel type, one instance is built per thread and sequence
/// * `F` - Kernel factory, shared by all hammering threads
pub struct HammerSuite<'a, T, K, F>
where
    T: AccessTimer + Sync,
    K: HammerKernel,
    F: Fn() -> K + Sync,
{
    memory: &'a Memory,
    dram: &'a DramConfig,
    timer: &'a RefreshTimer<T>,
    kernel_factory: F,
    config: SuiteConfig,
    rng: Rng,
    banks: BankCounter,
    checker: MemCheck<'a>,
    progress: Option<MultiProgress>,
    _kernel: PhantomData<fn() -> K>,
}

impl<'a, T, K, F> HammerSuite<'a, T, K, F>
where
    T: AccessTimer + Sync,
    K: HammerKernel,
    F: Fn() -> K + Sync,
{
    /// Creates a suite. `checker` must have been initialized on `memory`.
    pub fn new(
        memory: &'a Memory,
        dram: &'a DramConfig,
        timer: &'a RefreshTimer<T>,
        checker: MemCheck<'a>,
        kernel_factory: F,
        config: SuiteConfig,
    ) -> Self {
        HammerSuite {
            memory,
            dram,
            timer,
            kernel_factory,
            rng: Rng::from_seed(config.seed),
            banks: BankCounter::new(dram.banks()),
            config,
            checker,
            progress: None,
            _kernel: PhantomData,
        }
    }

    /// Shows progress bars on `progress`.
    pub fn with_progress(mut self, progress: MultiProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// The run configuration.
    pub fn config(&self) -> &SuiteConfig {
        &self.config
    }

    /// Runs [`Self::fuzz`] until the runtime budget is spent, then the
    /// effective-pattern sweep if requested.
    ///
    /// # Errors
    ///
    /// Returns the first [`SuiteError`] of a run.
    pub fn auto_fuzz(&mut self) -> Result<AutoFuzzReport, SuiteError> {
        let start = Instant::now();
        let runtime = self.config.runtime;
        let bar = self.progress.as_ref().map(|p| {
            let bar = p.add(ProgressBar::new(runtime.as_secs()));
            bar.set_style(ProgressStyle::named_bar("Runtime"));
            bar
        });
        let mut runs: Vec<FuzzReport> = vec![];
        while start.elapsed() < runtime {
            if let Some(bar) = &bar {
                bar.set_position(start.elapsed().as_secs().min(runtime.as_secs()));
                bar.set_message(format!(
                    "{} runs, {} flips",
                    runs.len(),
                    runs.iter().map(|r| r.sum_flips()).sum::<usize>()
                ));
            }
            let report = self.fuzz()?;
            info!(
                "run {} done: {} flipped bits",
                runs.len() + 1,
                report.sum_flips()
            );
            runs.push(report);
        }
        if let Some(bar) = bar {
            bar.finish();
        }
        info!("fuzzing finished after {} runs", runs.len());

        let sweep = if self.config.fuzz_random || self.config.fuzz_combined {
            Some(self.check_effective_patterns(&runs)?)
        } else {
            None
        };
        Ok(AutoFuzzReport { runs, sweep })
    }

    /// One fuzz run: draws a parameter set, builds one pattern per thread on
    /// consecutive banks and hammers them at all configured locations.
    ///
    /// Patterns that cannot be mapped are dropped and listed in the report.
    /// If no pattern can be mapped, no location is hammered.
    ///
    /// # Errors
    ///
    /// Returns [`SuiteError::NotCalibrated`] if the activations per refresh
    /// interval are unknown.
    pub fn fuzz(&mut self) -> Result<FuzzReport, SuiteError> {
        let params = self.random_params()?;
        let mut report = FuzzReport::new(params.clone());
        let mut patterns = vec![];
        let mut pattern_params = params.clone();
        for i in 0..self.config.threads.max(1) {
            if i > 0 && self.config.randomize_each {
                pattern_params = self.random_params()?;
            }
            let simple = if i == 0 {
                self.config.simple_first
            } else {
                self.config.simple_other
            };
            let bank = self.banks.next_bank();
            match self.create_pattern(pattern_params.clone(), bank, simple) {
                Ok(p) => patterns.push(p),
                Err(e) => {
                    warn!("dropping pattern for bank {}: {}", bank, e);
                    report.drop_pattern(bank, e);
                }
            }
        }
        if patterns.is_empty() {
            warn!("no pattern of this run could be mapped");
            return Ok(report);
        }
        debug!(
            "generated patterns {:?}",
            patterns.iter().map(|p| p.id()).collect::<Vec<_>>()
        );

        for location in self.fuzz_location(&mut patterns, self.config.locations)? {
            report.add_report(location);
        }
        Ok(report)
    }

    /// Generates a pattern from `params` and maps it into `bank`.
    ///
    /// # Errors
    ///
    /// Returns a [`MappingError`] if the pattern cannot be placed.
    pub fn create_pattern(
        &mut self,
        params: FuzzingParameterSet,
        bank: usize,
        simple: bool,
    ) -> Result<MappedPattern, MappingError> {
        let pattern = if simple {
            SimplePatternBuilder::new(&params).generate(&mut self.rng)
        } else {
            FrequencyPatternBuilder::new(&params).generate(&mut self.rng)
        };
        let mut mapper = PatternAddressMapper::new(bank, self.memory.bounds(), self.rng.fork());
        mapper.randomize_addresses(
            &params,
            &pattern.agg_access_patterns,
            &self.dram.mem_config,
            true,
        )?;
        Ok(MappedPattern {
            pattern,
            mapper,
            params,
        })
    }

    /// Hammers `patterns` at `locations` locations.
    ///
    /// The first location uses the mappings as they are. Before every further
    /// location each mapping moves up by 1 to [`MAX_SHIFT_ROWS`] rows. A
    /// pattern that cannot move is skipped at that location.
    ///
    /// # Errors
    ///
    /// Returns [`SuiteError::NoLocations`] if `locations` is zero.
    pub fn fuzz_location(
        &mut self,
        patterns: &mut [MappedPattern],
        locations: usize,
    ) -> Result<Vec<LocationReport>, SuiteError> {
        if locations == 0 {
            return Err(SuiteError::NoLocations);
        }
        let bar = self.progress.as_ref().map(|p| {
            let bar = p.add(ProgressBar::new(locations as u64));
            bar.set_style(ProgressStyle::named_bar("Locations"));
            bar
        });
        let dram = self.dram;
        let mem_config = &dram.mem_config;
        let no_exclusions = HashSet::new();
        let mut reports = vec![];
        for location in 0..locations {
            if let Some(bar) = &bar {
                bar.set_position(location as u64 + 1);
            }
            let mut skipped = vec![];
            if location > 0 {
                for p in patterns.iter_mut() {
                    let delta = self.rng.random_range(1..=MAX_SHIFT_ROWS) as isize;
                    if let Err(e) = p.mapper.shift_mapping(delta, &no_exclusions, mem_config) {
                        warn!("location {}: skipping pattern {}: {}", location, p.id(), e);
                        skipped.push(p.pattern.id.clone());
                    }
                }
            }
            let active = patterns
                .iter_mut()
                .filter(|p| !skipped.contains(&p.pattern.id))
                .collect::<Vec<_>>();
            let mut report = self.hammer_patterns(active);
            for id in skipped {
                report.skip(id);
            }
            info!(
                "location {}/{}: {} flipped bits{}",
                location + 1,
                locations,
                report.sum_flips(),
                if report.is_partial() { " (partial)" } else { "" }
            );
            reports.push(report);
        }
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }
        Ok(reports)
    }

    /// Hammers `patterns` once at their current mapping.
    pub fn fuzz_pattern(&mut self, patterns: &mut [MappedPattern]) -> LocationReport {
        self.hammer_patterns(patterns.iter_mut().collect())
    }

    /// Replays the effective patterns of `reports`.
    ///
    /// The random sweep takes the patterns of every location with flips and
    /// runs them with 1 to [`MAX_SWEEP_THREADS`] threads, adding fresh
    /// patterns on unused banks where the location had fewer. The combined
    /// sweep runs 1 to [`MAX_COMBINED_PATTERNS`] effective patterns from
    /// distinct banks together.
    ///
    /// # Errors
    ///
    /// Returns [`SuiteError::NotCalibrated`] if fresh parameters are needed
    /// but cannot be drawn.
    pub fn check_effective_patterns(
        &mut self,
        reports: &[FuzzReport],
    ) -> Result<EffectiveSweep, SuiteError> {
        let analysis = analyze_flips(reports);
        analysis.log();
        let mut sweep = EffectiveSweep {
            analysis,
            ..Default::default()
        };

        if self.config.fuzz_random {
            for location in reports
                .iter()
                .flat_map(|r| r.reports())
                .filter(|l| l.sum_flips() > 0)
            {
                let base = location
                    .reports()
                    .iter()
                    .map(|r| replay(&r.pattern))
                    .collect::<Vec<_>>();
                for threads in 1..=MAX_SWEEP_THREADS {
                    let mut set = self.sweep_set(&base, threads)?;
                    let Some(first) = set.first() else {
                        continue;
                    };
                    let mut report = FuzzReport::new(first.params.clone());
                    for l in self.fuzz_location(&mut set, SWEEP_LOCATIONS)? {
                        report.add_report(l);
                    }
                    info!(
                        "random sweep, {} threads: {} flipped bits",
                        threads,
                        report.sum_flips()
                    );
                    sweep.random.push(report);
                }
            }
        }

        if self.config.fuzz_combined {
            let mut effective = reports
                .iter()
                .flat_map(|r| r.reports())
                .flat_map(|l| l.reports())
                .filter(|r| r.is_effective())
                .map(|r| replay(&r.pattern))
                .collect::<Vec<_>>();
            while !effective.is_empty() {
                for n in 1..=MAX_COMBINED_PATTERNS {
                    let mut set = effective
                        .iter()
                        .unique_by(|p| p.mapper.bank)
                        .take(n)
                        .cloned()
                        .collect::<Vec<_>>();
                    if set.len() < n {
                        debug!("only {} effective patterns on distinct banks", set.len());
                        break;
                    }
                    let mut report = FuzzReport::new(set[0].params.clone());
                    for l in self.fuzz_location(&mut set, 1)? {
                        report.add_report(l);
                    }
                    info!(
                        "combined sweep, {} patterns: {} flipped bits",
                        n,
                        report.sum_flips()
                    );
                    sweep.combined.push(report);
                }
                effective.remove(0);
                effective.shuffle(&mut self.rng);
            }
        }
        Ok(sweep)
    }

    fn random_params(&mut self) -> Result<FuzzingParameterSet, SuiteError> {
        let acts = self.dram.acts_per_trefi().ok_or(SuiteError::NotCalibrated)?;
        let mut params =
            FuzzingParameterSet::random(acts as usize, &self.config.overrides(), &mut self.rng)?;
        if let Some(activations) = self.config.hammering_activations {
            params.hammering_activations = activations;
        }
        Ok(params)
    }

    /// The first `threads` patterns of `base`, padded with fresh patterns on
    /// banks none of them uses.
    fn sweep_set(
        &mut self,
        base: &[MappedPattern],
        threads: usize,
    ) -> Result<Vec<MappedPattern>, SuiteError> {
        let mut set = base.iter().take(threads).cloned().collect::<Vec<_>>();
        let Some(first) = set.first() else {
            return Ok(set);
        };
        let bank_count = self.dram.banks();
        let mut used = set.iter().map(|p| p.mapper.bank).collect::<HashSet<_>>();
        let mut bank = first.mapper.bank;
        let first_params = first.params.clone();
        while set.len() < threads && used.len() < bank_count {
            while used.contains(&bank) {
                bank = (bank + 1) % bank_count;
            }
            used.insert(bank);
            let params = if self.config.randomize_each {
                self.random_params()?
            } else {
                first_params.clone()
            };
            match self.create_pattern(params, bank, self.config.simple_other) {
                Ok(p) => set.push(p),
                Err(e) => warn!("sweep: no pattern for bank {}: {}", bank, e),
            }
        }
        if set.len() < threads {
            warn!("sweep: only {} of {} patterns", set.len(), threads);
        }
        Ok(set)
    }

    /// Exports, hammers and verifies one location.
    fn hammer_patterns(&mut self, patterns: Vec<&mut MappedPattern>) -> LocationReport {
        let mut report = LocationReport::default();
        let dram = self.dram;
        let mem_config = &dram.mem_config;
        let ncpu = cpu_count();
        let mut jobs = vec![];
        let mut runnable = vec![];
        for p in patterns {
            match p
                .mapper
                .export_pattern(&p.pattern, p.params.scheduling, mem_config)
            {
                Ok(accesses) => {
                    let cpu = (self.config.thread_start_id + jobs.len()) % ncpu;
                    jobs.push(job(p, accesses, cpu, dram));
                    runnable.push(p);
                }
                Err(e) => {
                    warn!("cannot export pattern {}: {}", p.id(), e);
                    report.skip(p.pattern.id.clone());
                }
            }
        }
        if jobs.is_empty() {
            return report;
        }

        let timings = if self.config.interleaved {
            self.hammer_interleaved(&jobs)
        } else {
            self.hammer_threaded(&jobs)
        };

        for (p, timing) in runnable.into_iter().zip(timings) {
            match timing {
                Some(timing) => {
                    let pattern_report = self.verify(p, timing);
                    report.add_report(pattern_report);
                }
                None => report.skip(p.pattern.id.clone()),
            }
        }
        report
    }

    /// One scoped thread per job, all released by one barrier.
    fn hammer_threaded(&self, jobs: &[HammerJob]) -> Vec<Option<HammerTiming>> {
        let barrier = Barrier::new(jobs.len());
        let factory = &self.kernel_factory;
        let timer = self.timer;
        std::thread::scope(|s| {
            let handles = jobs
                .iter()
                .map(|job| {
                    let barrier = &barrier;
                    s.spawn(move || {
                        let mut kernel = factory();
                        threads::hammer(job, &mut kernel, timer, barrier)
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .zip(jobs)
                .map(|(handle, job)| match handle.join() {
                    Ok(Ok(timing)) => Some(timing),
                    Ok(Err(e)) => {
                        error!("pattern {}: kernel failed: {}", job.id, e);
                        None
                    }
                    Err(_) => {
                        error!("pattern {}: hammering thread panicked", job.id);
                        None
                    }
                })
                .collect()
        })
    }

    /// Merges all jobs into one sequence and runs it on one scoped thread.
    ///
    /// The worker is pinned, the calling thread keeps its affinity.
    fn hammer_interleaved(&self, jobs: &[HammerJob]) -> Vec<Option<HammerTiming>> {
        let sequences = jobs
            .iter()
            .map(|j| j.access_loop.accesses.clone())
            .collect::<Vec<_>>();
        let first = &jobs[0];
        let merged = HammerJob {
            id: jobs.iter().map(|j| j.id.as_str()).join("+"),
            access_loop: AccessLoop {
                accesses: PatternAddressMapper::interleave(
                    &sequences,
                    self.config.interleave_single_pair_only,
                    self.config.interleave_distance,
                ),
                activations: jobs.iter().map(|j| j.access_loop.activations).sum(),
                ..first.access_loop.clone()
            },
            sync_rows: jobs
                .iter()
                .flat_map(|j| j.sync_rows.iter().copied())
                .collect(),
            ..first.clone()
        };
        let factory = &self.kernel_factory;
        let timer = self.timer;
        let merged = &merged;
        let timing = std::thread::scope(|s| {
            s.spawn(move || {
                let mut kernel = factory();
                threads::hammer(merged, &mut kernel, timer, &Barrier::new(1))
            })
            .join()
        });
        let timing = match timing {
            Ok(Ok(timing)) => Some(timing),
            Ok(Err(e)) => {
                error!("interleaved patterns {}: kernel failed: {}", merged.id, e);
                None
            }
            Err(_) => {
                error!("interleaved patterns {}: hammering thread panicked", merged.id);
                None
            }
        };
        vec![timing; jobs.len()]
    }

    /// Scans the victim rows of `p` and records the flips.
    fn verify(&mut self, p: &mut MappedPattern, timing: HammerTiming) -> PatternReport {
        let flips =
            self.checker
                .check_rows(p.mapper.bank, p.mapper.victim_rows(), &self.dram.mem_config);
        let counted = if self.config.reproducibility_mode {
            let fresh = flips
                .iter()
                .filter(|f| !p.mapper.has_flip(f.addr, f.bitmask))
                .copied()
                .collect::<Vec<_>>();
            let counted = flipped_bits(&fresh);
            p.mapper.add_bit_flips(fresh);
            counted
        } else {
            p.mapper.add_bit_flips(flips.clone());
            self.checker.restore(&flips);
            flipped_bits(&flips)
        };
        if counted > 0 {
            info!(
                "pattern {}: {} flipped bits in bank {}",
                p.id(),
                counted,
                p.mapper.bank
            );
        }
        PatternReport {
            pattern: p.clone(),
            flips: counted,
            duration: timing.duration(),
            cycles: Some(timing.cycles),
            bit_flips: flips,
        }
    }
}

fn job(p: &MappedPattern, accesses: Vec<Access>, cpu: usize, dram: &DramConfig) -> HammerJob {
    HammerJob {
        id: p.pattern.id.clone(),
        access_loop: AccessLoop {
            accesses,
            activations: p.params.hammering_activations,
            flushing: p.params.flushing,
            fencing: p.params.fencing,
            fence_type: p.params.fence_type,
            sync_each_iteration: p.params.sync_each_ref,
        },
        sync_rows: p.mapper.sync_rows(WARMUP_ROWS, &dram.mem_config),
        bank: p.mapper.bank,
        cpu,
        sync_each_ref: p.params.sync_each_ref,
        warmup: p.params.wait_until_start_hammering(),
    }
}

/// A copy of `p` with an empty flip history.
fn replay(p: &MappedPattern) -> MappedPattern {
    let mut p = p.clone();
    p.mapper.clear_bit_flips();
    p
}

fn flipped_bits(flips: &[BitFlip]) -> usize {
    flips.iter().map(|f| f.bitmask.count_ones() as usize).sum()
}
