use std::path::PathBuf;
use std::time::Duration;

use anvil_bin::{init_logging_with_progress, save_flips, save_json};
use anvil_core::allocator::alloc_region;
use anvil_core::hammerer::HammerKernel;
use anvil_core::memory::{
    Calibration, DataPattern, DramConfig, LinuxPageMap, LinuxPageMapError, MemCheck, Memory,
    RdtscpTimer, RefreshTimer, VirtToPhysResolver,
};
use anvil_core::pattern::{FenceType, FencingStrategy, FlushingStrategy, SchedulingPolicy};
use anvil_core::suite::{AutoFuzzReport, HammerSuite, SuiteConfig, analyze_flips, flip_records};
use anvil_core::util::REFRESH_SAMPLES;
use anvil_hugepage::HugepageAllocator;
use anvil_interp::InterpKernel;
use anvil_jit::JitKernel;
use anyhow::Result;
use clap::{Parser, ValueEnum};
use indicatif::MultiProgress;
use log::{info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;

const GIB: usize = 1 << 30;

/// Kernel used to run the access loops.
#[derive(Debug, Clone, Copy, ValueEnum, Serialize)]
enum Kernel {
    /// Native code emitted at runtime
    Jit,
    /// Loop interpreted in Rust
    Interp,
}

/// Reference fill of the target region.
#[derive(Debug, Clone, Copy, ValueEnum, Serialize)]
enum Fill {
    /// All zeros
    Zero,
    /// All ones
    One,
    /// Seeded random bytes
    Random,
}

/// CLI arguments for the `anvil-fuzz` binary.
#[derive(Debug, Parser, Serialize, Clone)]
#[command(about = "Fuzz DRAM for bit flips with frequency-domain hammering patterns")]
struct CliArgs {
    /// The DRAM profile.
    #[clap(long = "config", default_value = "config/bs-config.json")]
    config: PathBuf,
    /// Fuzzing budget in seconds.
    #[clap(long = "runtime", default_value = "120")]
    runtime: u64,
    /// Locations per run.
    #[clap(long = "locations", default_value = "3")]
    locations: usize,
    /// Patterns hammered concurrently.
    #[clap(long = "threads", default_value = "1")]
    threads: usize,
    /// Seed of the random stream. Drawn at random if absent.
    #[clap(long = "seed")]
    seed: Option<u64>,
    /// Hammering kernel.
    #[clap(long = "kernel", value_enum, default_value = "jit")]
    kernel: Kernel,
    /// Reference fill of the target region.
    #[clap(long = "fill", value_enum, default_value = "random")]
    fill: Fill,
    /// Interleave all patterns on one thread.
    #[clap(long = "interleaved")]
    interleaved: bool,
    /// Accesses taken from a sequence per interleaving turn.
    #[clap(long = "interleave-distance", default_value = "2")]
    interleave_distance: usize,
    /// Take only one pair per turn from every sequence but the first.
    #[clap(long = "interleave-single-pair-only")]
    interleave_single_pair_only: bool,
    /// Use the simple generator for the first pattern.
    #[clap(long = "simple-first")]
    simple_first: bool,
    /// Use the simple generator for all other patterns.
    #[clap(long = "simple-other")]
    simple_other: bool,
    /// Draw fresh parameters for every pattern of a run.
    #[clap(long = "randomize-each")]
    randomize_each: bool,
    /// Fixed flushing strategy, e.g. `EarliestPossible`.
    #[clap(long = "flushing", value_parser = variant::<FlushingStrategy>)]
    flushing: Option<FlushingStrategy>,
    /// Fixed fencing strategy, e.g. `OmitFencing`.
    #[clap(long = "fencing", value_parser = variant::<FencingStrategy>)]
    fencing: Option<FencingStrategy>,
    /// Fixed fence instruction, e.g. `Lfence`.
    #[clap(long = "fence-type", value_parser = variant::<FenceType>)]
    fence_type: Option<FenceType>,
    /// Fixed scheduling policy, e.g. `Repetition`.
    #[clap(long = "scheduling", value_parser = variant::<SchedulingPolicy>)]
    scheduling: Option<SchedulingPolicy>,
    /// Fixed number of activations per kernel run.
    #[clap(long = "hammering-activations")]
    hammering_activations: Option<usize>,
    /// CPU of the first hammering thread.
    #[clap(long = "thread-start-id", default_value = "0")]
    thread_start_id: usize,
    /// Replay effective patterns with 1 to 8 threads after fuzzing.
    #[clap(long = "fuzz-random")]
    fuzz_random: bool,
    /// Replay combinations of effective patterns after fuzzing.
    #[clap(long = "fuzz-combined")]
    fuzz_combined: bool,
    /// Leave flips in memory and count each one only once.
    #[clap(long = "reproducibility-mode")]
    reproducibility_mode: bool,
    /// Use an ordinary aligned mapping instead of a hugepage.
    #[clap(long = "dry-run")]
    dry_run: bool,
    /// JSON summary output.
    #[clap(long = "summary", default_value = "fuzz-summary.json")]
    summary: PathBuf,
    /// CSV flip output.
    #[clap(long = "flips", default_value = "flips.csv")]
    flips: PathBuf,
}

impl CliArgs {
    fn suite_config(&self, seed: u64) -> SuiteConfig {
        SuiteConfig {
            runtime: Duration::from_secs(self.runtime),
            locations: self.locations,
            threads: self.threads,
            seed,
            interleaved: self.interleaved,
            interleave_distance: self.interleave_distance,
            interleave_single_pair_only: self.interleave_single_pair_only,
            simple_first: self.simple_first,
            simple_other: self.simple_other,
            randomize_each: self.randomize_each,
            flushing: self.flushing,
            fencing: self.fencing,
            fence_type: self.fence_type,
            scheduling: self.scheduling,
            hammering_activations: self.hammering_activations,
            thread_start_id: self.thread_start_id,
            fuzz_random: self.fuzz_random,
            fuzz_combined: self.fuzz_combined,
            reproducibility_mode: self.reproducibility_mode,
        }
    }
}

/// Parses a unit enum variant by its serde name.
fn variant<T: DeserializeOwned>(s: &str) -> Result<T, serde_json::Error> {
    serde_json::from_value(serde_json::Value::String(s.to_owned()))
}

#[derive(Serialize)]
struct Summary<'a> {
    args: &'a CliArgs,
    config: &'a SuiteConfig,
    profile: &'a str,
    calibration: Calibration,
    report: &'a AutoFuzzReport,
}

fn raise_priority() {
    if unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, -20) } != 0 {
        warn!(
            "failed to raise process priority: {}",
            std::io::Error::last_os_error()
        );
    }
}

fn run_suite<K, F>(
    memory: &Memory,
    dram: &DramConfig,
    timer: &RefreshTimer<RdtscpTimer>,
    checker: MemCheck<'_>,
    factory: F,
    config: SuiteConfig,
    progress: MultiProgress,
) -> Result<AutoFuzzReport>
where
    K: HammerKernel,
    F: Fn() -> K + Sync,
{
    let mut suite =
        HammerSuite::new(memory, dram, timer, checker, factory, config).with_progress(progress);
    Ok(suite.auto_fuzz()?)
}

fn fuzz(
    args: &CliArgs,
    memory: &Memory,
    dram: &DramConfig,
    progress: MultiProgress,
) -> Result<()> {
    let seed = args.seed.unwrap_or_else(rand::random);
    let config = args.suite_config(seed);
    info!("Seed: {}", seed);

    let data_pattern = match args.fill {
        Fill::Zero => DataPattern::Zero,
        Fill::One => DataPattern::One,
        Fill::Random => DataPattern::Random { seed },
    };
    let checker = if args.dry_run && data_pattern == DataPattern::Zero {
        // untouched anonymous pages read as zero
        MemCheck::resume(memory, data_pattern)
    } else {
        let mut checker = MemCheck::new(memory, data_pattern);
        checker.initialize();
        checker
    };

    let timer = RefreshTimer::calibrate(
        RdtscpTimer,
        memory.ptr,
        &dram.mem_config,
        REFRESH_SAMPLES,
    )?;
    let calibration = timer.calibration();
    info!("Refresh calibration: {:?}", calibration);
    dram.set_calibration(calibration)?;

    let report = match args.kernel {
        Kernel::Jit => run_suite(
            memory,
            dram,
            &timer,
            checker,
            JitKernel::new,
            config.clone(),
            progress,
        )?,
        Kernel::Interp => run_suite(
            memory,
            dram,
            &timer,
            checker,
            InterpKernel::new,
            config.clone(),
            progress,
        )?,
    };

    let mut runs = report.runs.clone();
    if let Some(sweep) = &report.sweep {
        runs.extend(sweep.random.iter().cloned());
        runs.extend(sweep.combined.iter().cloned());
    }
    analyze_flips(&report.runs).log();

    let mut pagemap = match LinuxPageMap::new() {
        Ok(pagemap) => Some(pagemap),
        Err(e) => {
            warn!("physical addresses unavailable: {}", e);
            None
        }
    };
    let resolver = pagemap
        .as_mut()
        .map(|p| p as &mut dyn VirtToPhysResolver<Error = LinuxPageMapError>);
    let records = flip_records(&runs, &dram.mem_config, resolver);
    save_flips(&args.flips, &records)?;
    save_json(
        &args.summary,
        &Summary {
            args,
            config: &config,
            profile: &dram.name,
            calibration,
            report: &report,
        },
    )?;
    Ok(())
}

fn main() -> Result<()> {
    let progress = init_logging_with_progress()?;

    let args = CliArgs::parse();
    info!("CLI args: {:?}", args);
    raise_priority();

    let dram = DramConfig::from_jsonfile(&args.config)?;
    let memory = if args.dry_run {
        info!("Dry run on an ordinary mapping");
        Memory::mmap_aligned(GIB, GIB)?
    } else {
        alloc_region(&mut HugepageAllocator::default())?
    };

    let result = fuzz(&args, &memory, &dram, progress);
    memory.dealloc();
    result
}
