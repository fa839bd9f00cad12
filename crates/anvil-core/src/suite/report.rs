//! Fuzzing reports and flip analysis.

use crate::memory::{BitFlip, DRAMAddr, MemConfiguration, VirtToPhysResolver};
use crate::pattern::FuzzingParameterSet;
use crate::suite::MappedPattern;
use itertools::Itertools;
use log::{info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Largest thread count covered by the analysis tables.
pub const MAX_ANALYZED_THREADS: usize = 8;

/// Outcome of one pattern at one location.
#[derive(Serialize, Debug, Clone)]
pub struct PatternReport {
    /// The pattern with the mapping it ran with
    pub pattern: MappedPattern,
    /// Flipped bits attributed to this run
    pub flips: usize,
    /// Wall-clock time from kernel start to release
    pub duration: Duration,
    /// Cycles reported by the kernel
    pub cycles: Option<u64>,
    /// Flips found in the victim rows
    pub bit_flips: Vec<BitFlip>,
}

impl PatternReport {
    /// Returns true if the run flipped at least one bit.
    pub fn is_effective(&self) -> bool {
        self.flips > 0
    }
}

/// Outcome of all patterns at one location.
#[derive(Serialize, Debug, Clone, Default)]
pub struct LocationReport {
    reports: Vec<PatternReport>,
    skipped: Vec<String>,
    partial: bool,
}

impl LocationReport {
    /// Appends a pattern report.
    pub fn add_report(&mut self, report: PatternReport) {
        self.reports.push(report);
    }

    /// Records a pattern that did not run here and marks the location partial.
    pub fn skip(&mut self, pattern_id: impl Into<String>) {
        self.skipped.push(pattern_id.into());
        self.partial = true;
    }

    /// Pattern reports in run order.
    pub fn reports(&self) -> &[PatternReport] {
        &self.reports
    }

    /// Ids of patterns that did not run.
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    /// Returns true if not every pattern ran.
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    /// Flipped bits over all patterns.
    pub fn sum_flips(&self) -> usize {
        self.reports.iter().map(|r| r.flips).sum()
    }

    /// Duration of the slowest pattern.
    pub fn duration(&self) -> Duration {
        self.reports
            .iter()
            .map(|r| r.duration)
            .max()
            .unwrap_or_default()
    }
}

/// A pattern that never ran because it could not be mapped.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DroppedPattern {
    /// Bank the pattern was meant for
    pub bank: usize,
    /// Why the mapping failed
    pub reason: String,
}

/// Outcome of one parameter set over all of its locations.
#[derive(Serialize, Debug, Clone)]
pub struct FuzzReport {
    params: FuzzingParameterSet,
    date: String,
    reports: Vec<LocationReport>,
    dropped: Vec<DroppedPattern>,
}

impl FuzzReport {
    /// Creates an empty report dated now.
    pub fn new(params: FuzzingParameterSet) -> Self {
        FuzzReport {
            params,
            date: chrono::Local::now().to_rfc3339(),
            reports: vec![],
            dropped: vec![],
        }
    }

    /// Appends a location report.
    pub fn add_report(&mut self, report: LocationReport) {
        self.reports.push(report);
    }

    /// Location reports in run order.
    pub fn reports(&self) -> &[LocationReport] {
        &self.reports
    }

    /// Parameters of this run.
    pub fn params(&self) -> &FuzzingParameterSet {
        &self.params
    }

    /// RFC 3339 creation date.
    pub fn date(&self) -> &str {
        &self.date
    }

    /// Flipped bits over all locations.
    pub fn sum_flips(&self) -> usize {
        self.reports.iter().map(|r| r.sum_flips()).sum()
    }

    /// Records a pattern that could not be mapped into `bank`.
    pub fn drop_pattern(&mut self, bank: usize, reason: impl Display) {
        self.dropped.push(DroppedPattern {
            bank,
            reason: reason.to_string(),
        });
    }

    /// Patterns that never ran.
    pub fn dropped(&self) -> &[DroppedPattern] {
        &self.dropped
    }

    /// Returns true if a pattern was dropped or skipped at some location.
    pub fn is_partial(&self) -> bool {
        !self.dropped.is_empty() || self.reports.iter().any(|r| r.is_partial())
    }
}

/// One exported bit flip.
///
/// The field order is the column order of the CSV export.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct FlipRecord {
    /// Index of the fuzz run
    pub run: usize,
    /// Index of the location inside the run
    pub location: usize,
    /// Index of the pattern inside the location
    pub pattern: usize,
    /// Patterns hammered concurrently
    pub threads: usize,
    /// Aggressors bound by the mapping
    pub mapped_addrs: usize,
    /// Accesses of one pattern iteration
    pub aggressors: usize,
    /// Hammering duration in microseconds
    pub duration_us: u128,
    /// Bank of the flipped byte
    pub bank: usize,
    /// Row of the flipped byte
    pub row: usize,
    /// Column of the flipped byte
    pub col: usize,
    /// Physical address, if resolvable
    pub phys_addr: Option<usize>,
    /// Flipped bits
    pub bitmask: u8,
    /// Bits that flipped from one to zero
    pub o2z: u32,
    /// Bits that flipped from zero to one
    pub z2o: u32,
}

impl FlipRecord {
    /// CSV header matching [`Display`].
    pub const HEADER: &'static str = "run;location;pattern;n_patterns;n_aggs;n_accesses;duration_us;bank;row;col;phys;bitmask;o2z;z2o";
}

impl Display for FlipRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{};{};{};{};{};{};{};{};{};{};",
            self.run,
            self.location,
            self.pattern,
            self.threads,
            self.mapped_addrs,
            self.aggressors,
            self.duration_us,
            self.bank,
            self.row,
            self.col
        )?;
        if let Some(phys) = self.phys_addr {
            write!(f, "{:x}", phys)?;
        }
        write!(f, ";{:b};{};{}", self.bitmask, self.o2z, self.z2o)
    }
}

/// Flattens reports into one [`FlipRecord`] per flipped byte.
///
/// Physical addresses are resolved with `resolver` when given. A failed
/// lookup leaves the field empty.
pub fn flip_records<E: std::error::Error>(
    reports: &[FuzzReport],
    mem_config: &MemConfiguration,
    mut resolver: Option<&mut dyn VirtToPhysResolver<Error = E>>,
) -> Vec<FlipRecord> {
    let mut records = vec![];
    for (run, fuzz) in reports.iter().enumerate() {
        for (location, loc) in fuzz.reports().iter().enumerate() {
            for (pattern, report) in loc.reports().iter().enumerate() {
                for flip in &report.bit_flips {
                    let addr = DRAMAddr::from_virt(flip.addr as *const u8, mem_config);
                    let phys_addr = match resolver.as_mut() {
                        Some(r) => match r.get_phys(flip.addr as u64) {
                            Ok(p) => Some(p.as_usize()),
                            Err(e) => {
                                warn!("cannot resolve 0x{:x}: {}", flip.addr, e);
                                None
                            }
                        },
                        None => None,
                    };
                    records.push(FlipRecord {
                        run,
                        location,
                        pattern,
                        threads: loc.reports().len(),
                        mapped_addrs: report.pattern.mapper.len(),
                        aggressors: report.pattern.pattern.aggressors.len(),
                        duration_us: report.duration.as_micros(),
                        bank: addr.bank,
                        row: addr.row,
                        col: addr.col,
                        phys_addr,
                        bitmask: flip.bitmask,
                        o2z: flip.count_o2z_corruptions(),
                        z2o: flip.count_z2o_corruptions(),
                    });
                }
            }
        }
    }
    records
}

/// Effectiveness of runs with the same number of concurrent patterns.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct ThreadStats {
    /// Concurrent patterns
    pub threads: usize,
    /// Effective patterns
    pub effective: usize,
    /// Mean pattern length of the effective patterns
    pub avg_len: f64,
    /// Mean number of mapped aggressors of the effective patterns
    pub avg_aggressors: f64,
    /// Mean number of distinct banks per location
    pub avg_banks: f64,
    /// Flipped bits
    pub flips: usize,
}

/// Effectiveness per bank.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct BankStats {
    /// Bank
    pub bank: usize,
    /// Effective patterns in this bank
    pub effective: usize,
    /// Flipped bits
    pub flips: usize,
}

/// Aggregated view over a set of fuzz reports.
#[derive(Serialize, Debug, Clone, Default)]
pub struct FlipAnalysis {
    /// Runs with at least one flip
    pub effective_runs: usize,
    /// Flipped bits over all runs
    pub total_flips: usize,
    /// One entry per thread count in `1..=MAX_ANALYZED_THREADS`
    pub threads: Vec<ThreadStats>,
    /// Banks with at least one effective pattern, ascending
    pub banks: Vec<BankStats>,
    /// Bits that flipped from one to zero
    pub one_to_zero: usize,
    /// Bits that flipped from zero to one
    pub zero_to_one: usize,
}

/// Builds the per-thread-count and per-bank tables.
pub fn analyze_flips(reports: &[FuzzReport]) -> FlipAnalysis {
    let mut analysis = FlipAnalysis {
        threads: (1..=MAX_ANALYZED_THREADS)
            .map(|threads| ThreadStats {
                threads,
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    };
    let mut banks: BTreeMap<usize, BankStats> = BTreeMap::new();
    let mut locations_per_threads = [0usize; MAX_ANALYZED_THREADS];
    let mut banks_per_threads = [0usize; MAX_ANALYZED_THREADS];

    for fuzz in reports {
        if fuzz.sum_flips() > 0 {
            analysis.effective_runs += 1;
        }
        analysis.total_flips += fuzz.sum_flips();
        for loc in fuzz.reports() {
            let n = loc.reports().len();
            if n == 0 || n > MAX_ANALYZED_THREADS {
                continue;
            }
            locations_per_threads[n - 1] += 1;
            banks_per_threads[n - 1] += loc
                .reports()
                .iter()
                .map(|r| r.pattern.mapper.bank)
                .unique()
                .count();
            let stats = &mut analysis.threads[n - 1];
            for report in loc.reports().iter().filter(|r| r.is_effective()) {
                stats.effective += 1;
                stats.avg_len += report.pattern.pattern.aggressors.len() as f64;
                stats.avg_aggressors += report.pattern.mapper.len() as f64;
                stats.flips += report.flips;
                let bank = report.pattern.mapper.bank;
                let entry = banks.entry(bank).or_insert(BankStats {
                    bank,
                    ..Default::default()
                });
                entry.effective += 1;
                entry.flips += report.flips;
                for flip in &report.bit_flips {
                    analysis.one_to_zero += flip.count_o2z_corruptions() as usize;
                    analysis.zero_to_one += flip.count_z2o_corruptions() as usize;
                }
            }
        }
    }
    for (i, stats) in analysis.threads.iter_mut().enumerate() {
        if stats.effective > 0 {
            stats.avg_len /= stats.effective as f64;
            stats.avg_aggressors /= stats.effective as f64;
        }
        if locations_per_threads[i] > 0 {
            stats.avg_banks = banks_per_threads[i] as f64 / locations_per_threads[i] as f64;
        }
    }
    analysis.banks = banks.into_values().collect();
    analysis
}

impl FlipAnalysis {
    /// Logs both tables.
    pub fn log(&self) {
        info!(
            "{} of the analyzed runs were effective, {} flipped bits ({} 1->0, {} 0->1)",
            self.effective_runs, self.total_flips, self.one_to_zero, self.zero_to_one
        );
        info!("threads | effective | avg length | avg aggressors | avg banks | flips");
        for t in &self.threads {
            info!(
                "{:>7} | {:>9} | {:>10.1} | {:>14.1} | {:>9.1} | {}",
                t.threads, t.effective, t.avg_len, t.avg_aggressors, t.avg_banks, t.flips
            );
        }
        info!("bank | effective | flips");
        for b in &self.banks {
            info!("{:>4} | {:>9} | {}", b.bank, b.effective, b.flips);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FlipRecord, FuzzReport, LocationReport, PatternReport, analyze_flips};
    use crate::memory::BitFlip;
    use crate::pattern::{
        FuzzingParameterSet, ParameterOverrides, PatternAddressMapper, PatternGenerator,
        SimplePatternBuilder,
    };
    use crate::suite::MappedPattern;
    use crate::util::{BASE_MSB, Rng};
    use std::time::Duration;

    fn report(bank: usize, flips: Vec<BitFlip>, millis: u64) -> PatternReport {
        let mut rng = Rng::from_seed(bank as u64);
        let params = FuzzingParameterSet::random(60, &ParameterOverrides::default(), &mut rng)
            .expect("params");
        let pattern = SimplePatternBuilder::new(&params).generate(&mut rng);
        let mapper = PatternAddressMapper::new(bank, BASE_MSB..BASE_MSB + (1 << 30), rng.fork());
        PatternReport {
            pattern: MappedPattern {
                pattern,
                mapper,
                params,
            },
            flips: flips.iter().map(|f| f.bitmask.count_ones() as usize).sum(),
            duration: Duration::from_millis(millis),
            cycles: None,
            bit_flips: flips,
        }
    }

    #[test]
    fn test_location_report() {
        let mut loc = LocationReport::default();
        assert_eq!(loc.duration(), Duration::ZERO);
        loc.add_report(report(0, vec![BitFlip::new(BASE_MSB as *const u8, 0b11, 0b01)], 5));
        loc.add_report(report(1, vec![], 9));
        assert_eq!(loc.sum_flips(), 2);
        assert_eq!(loc.duration(), Duration::from_millis(9));
        assert!(!loc.is_partial());
        loc.skip("abc");
        assert!(loc.is_partial());
        assert_eq!(loc.skipped(), ["abc".to_string()]);
    }

    #[test]
    fn test_analysis() {
        let params = report(0, vec![], 1).pattern.params;
        let mut fuzz = FuzzReport::new(params);
        let mut loc = LocationReport::default();
        loc.add_report(report(3, vec![BitFlip::new(BASE_MSB as *const u8, 0b1, 0b1)], 1));
        loc.add_report(report(4, vec![], 1));
        fuzz.add_report(loc);
        let mut loc = LocationReport::default();
        loc.add_report(report(3, vec![BitFlip::new(BASE_MSB as *const u8, 0b10, 0b0)], 1));
        fuzz.add_report(loc);

        let analysis = analyze_flips(&[fuzz]);
        assert_eq!(analysis.effective_runs, 1);
        assert_eq!(analysis.total_flips, 2);
        assert_eq!(analysis.threads.len(), 8);
        assert_eq!(analysis.threads[0].effective, 1);
        assert_eq!(analysis.threads[1].effective, 1);
        assert_eq!(analysis.threads[1].avg_banks, 2.0);
        assert_eq!(analysis.banks.len(), 1);
        assert_eq!(analysis.banks[0].bank, 3);
        assert_eq!(analysis.banks[0].effective, 2);
        assert_eq!((analysis.one_to_zero, analysis.zero_to_one), (1, 1));
    }

    #[test]
    fn test_flip_record_line() {
        let record = FlipRecord {
            run: 1,
            location: 2,
            pattern: 0,
            threads: 3,
            mapped_addrs: 12,
            aggressors: 240,
            duration_us: 1500,
            bank: 7,
            row: 100,
            col: 64,
            phys_addr: Some(0x1234abc),
            bitmask: 0b100,
            o2z: 1,
            z2o: 0,
        };
        assert_eq!(record.to_string(), "1;2;0;3;12;240;1500;7;100;64;1234abc;100;1;0");
        let unresolved = FlipRecord {
            phys_addr: None,
            ..record
        };
        assert_eq!(unresolved.to_string(), "1;2;0;3;12;240;1500;7;100;64;;100;1;0");
        assert_eq!(FlipRecord::HEADER.split(';').count(), 14);
    }
}
