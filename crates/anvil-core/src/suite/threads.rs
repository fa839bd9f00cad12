use crate::hammerer::{AccessLoop, HammerKernel};
use crate::memory::{AccessTimer, RefreshTimer};
use log::{debug, trace, warn};
use std::arch::x86_64::_mm_clflush;
use std::sync::Barrier;
use std::time::{Duration, Instant};

/// Minimum number of sync row reads before a thread joins the barrier.
pub const WARMUP_READS: usize = 10_000;
/// Rows per pattern that are read during warm-up.
pub const WARMUP_ROWS: usize = 32;

/// Everything one hammering thread needs. Addresses only, no pointers.
#[derive(Debug, Clone)]
pub(crate) struct HammerJob {
    pub id: String,
    pub access_loop: AccessLoop,
    pub sync_rows: Vec<usize>,
    pub bank: usize,
    pub cpu: usize,
    pub sync_each_ref: bool,
    pub warmup: Duration,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct HammerTiming {
    pub start: Instant,
    pub end: Instant,
    pub cycles: u64,
}

impl HammerTiming {
    pub fn duration(&self) -> Duration {
        self.end.duration_since(self.start)
    }
}

/// Emits, synchronizes and runs one kernel.
///
/// The barrier is passed exactly once, also when emission fails, so the
/// remaining threads of the round are never left waiting.
pub(crate) fn hammer<T: AccessTimer, K: HammerKernel>(
    job: &HammerJob,
    kernel: &mut K,
    timer: &RefreshTimer<T>,
    barrier: &Barrier,
) -> Result<HammerTiming, K::Error> {
    if let Err(e) = emit(job, kernel, timer) {
        barrier.wait();
        kernel.release();
        return Err(e);
    }
    pin_to_cpu(job.cpu);
    unsafe { libc::sched_yield() };
    let reads = warm_up(&job.sync_rows, job.warmup);
    trace!("{}: {} warm-up reads", job.id, reads);

    barrier.wait();
    let start = Instant::now();
    let waited = timer.wait_for_refresh(job.bank);
    trace!("{}: refresh after {} measurements", job.id, waited);
    let run = kernel.run();
    kernel.release();
    let end = Instant::now();
    let run = run?;
    debug!(
        "{}: hammered bank {} for {:?} ({} cycles)",
        job.id,
        job.bank,
        end - start,
        run.cycles
    );
    Ok(HammerTiming {
        start,
        end,
        cycles: run.cycles,
    })
}

fn emit<T: AccessTimer, K: HammerKernel>(
    job: &HammerJob,
    kernel: &mut K,
    timer: &RefreshTimer<T>,
) -> Result<(), K::Error> {
    if job.sync_each_ref {
        kernel.emit_refresh_sync(timer.sync(job.bank))?;
    }
    kernel.emit_access_loop(&job.access_loop)
}

/// Pins the calling thread to `cpu`. Only called on hammering workers.
/// Failure is logged and ignored.
pub(crate) fn pin_to_cpu(cpu: usize) {
    use libc::{CPU_SET, CPU_ZERO, cpu_set_t, sched_setaffinity};

    unsafe {
        let mut cpuset: cpu_set_t = std::mem::zeroed();
        CPU_ZERO(&mut cpuset);
        CPU_SET(cpu, &mut cpuset);
        if sched_setaffinity(0, std::mem::size_of::<cpu_set_t>(), &cpuset) != 0 {
            warn!(
                "failed to pin thread to cpu {}: {}",
                cpu,
                std::io::Error::last_os_error()
            );
        }
    }
}

/// Reads `rows` round-robin, uncached, for at least [`WARMUP_READS`] reads
/// and at least `duration`. Returns the number of reads.
pub(crate) fn warm_up(rows: &[usize], duration: Duration) -> usize {
    if rows.is_empty() {
        return 0;
    }
    let start = Instant::now();
    let mut reads = 0;
    for &addr in rows.iter().cycle() {
        unsafe {
            std::ptr::read_volatile(addr as *const u8);
            _mm_clflush(addr as *const u8);
        }
        reads += 1;
        if reads >= WARMUP_READS && start.elapsed() >= duration {
            break;
        }
    }
    reads
}

/// Number of online CPUs, at least one.
pub(crate) fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
