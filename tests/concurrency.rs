use anvil::hammerer::{AccessLoop, HammerKernel, KernelRun, RefreshSync};
use anvil::memory::{
    AccessTimer, AggressorPtr, Calibration, DRAMAddr, DataPattern, DramConfig, MemCheck,
    Measurement, Memory, RefreshTimer,
};
use anvil::suite::{HammerSuite, SuiteConfig};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

const CONFIG_FILE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/config/bs-config.json");
const GIB: usize = 1 << 30;
const THREADS: usize = 4;

const CALIBRATION: Calibration = Calibration {
    threshold: 100,
    cycles_per_refresh: 10_000,
    acts_per_refresh: 60,
    rounds: 1,
};

/// Every event takes one tick of a shared logical clock.
#[derive(Default)]
struct LogicalClock {
    now: AtomicU64,
    /// (tick, sync address) of every refresh measurement
    measurements: Mutex<Vec<(u64, usize)>>,
    /// (tick, first aggressor address) of every kernel start
    runs: Mutex<Vec<(u64, usize)>>,
}

impl LogicalClock {
    fn tick(&self) -> u64 {
        self.now.fetch_add(1, Ordering::SeqCst)
    }
}

/// Refresh timer whose every measurement hits a refresh.
struct ClockTimer<'a>(&'a LogicalClock);

impl AccessTimer for ClockTimer<'_> {
    unsafe fn measure(&self, addr: AggressorPtr) -> Measurement {
        let tick = self.0.tick();
        self.0
            .measurements
            .lock()
            .expect("lock")
            .push((tick, addr as usize));
        Measurement {
            timing: 150,
            timestamp: tick,
        }
    }
}

struct RecordingKernel<'a> {
    clock: &'a LogicalClock,
    first: Option<usize>,
}

impl HammerKernel for RecordingKernel<'_> {
    type Error = std::io::Error;

    fn emit_refresh_sync(&mut self, _sync: RefreshSync) -> Result<(), Self::Error> {
        Ok(())
    }

    fn emit_access_loop(&mut self, access_loop: &AccessLoop) -> Result<(), Self::Error> {
        self.first = access_loop.accesses.iter().find_map(|a| a.addr());
        self.first
            .map(|_| ())
            .ok_or_else(|| std::io::Error::other("empty sequence"))
    }

    fn run(&mut self) -> Result<KernelRun, Self::Error> {
        let first = self
            .first
            .ok_or_else(|| std::io::Error::other("nothing emitted"))?;
        let tick = self.clock.tick();
        self.clock.runs.lock().expect("lock").push((tick, first));
        Ok(KernelRun { cycles: 1 })
    }

    fn release(&mut self) {
        self.first = None;
    }
}

#[test]
fn test_threads_wait_for_refresh_on_their_bank() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let dram = DramConfig::from_jsonfile(CONFIG_FILE)?;
    dram.set_calibration(CALIBRATION)?;
    let memory = Memory::mmap_aligned(GIB, GIB)?;
    let clock = LogicalClock::default();
    let timer = RefreshTimer::from_calibration(
        ClockTimer(&clock),
        memory.ptr,
        &dram.mem_config,
        CALIBRATION,
    )?;
    let config = SuiteConfig {
        threads: THREADS,
        locations: 1,
        seed: 42,
        hammering_activations: Some(1000),
        simple_first: true,
        simple_other: true,
        ..Default::default()
    };
    let factory = || RecordingKernel {
        clock: &clock,
        first: None,
    };
    let report = {
        let checker = MemCheck::resume(&memory, DataPattern::Zero);
        let mut suite = HammerSuite::new(&memory, &dram, &timer, checker, factory, config);
        suite.fuzz()?
    };

    let location = &report.reports()[0];
    assert!(!location.is_partial());
    assert_eq!(location.reports().len(), THREADS);
    let banks = location
        .reports()
        .iter()
        .map(|r| r.pattern.mapper.bank)
        .collect::<BTreeSet<_>>();
    assert_eq!(banks, (0..THREADS).collect());

    let measurements = clock.measurements.lock().expect("lock").clone();
    let runs = clock.runs.lock().expect("lock").clone();
    assert_eq!(runs.len(), THREADS);
    let mut run_banks = HashMap::new();
    for (tick, first) in runs {
        let bank = DRAMAddr::from_virt(first as AggressorPtr, &dram.mem_config).bank;
        let sync = timer.sync_addr(bank);
        assert!(
            measurements.iter().any(|&(t, addr)| addr == sync && t < tick),
            "kernel on bank {} started without a refresh wait",
            bank
        );
        run_banks.insert(bank, tick);
    }
    assert_eq!(run_banks.len(), THREADS);

    memory.dealloc();
    Ok(())
}
