//! Refresh synchronization.
//!
//! DRAM refresh commands stall row activations for a short moment. A flushed
//! load that collides with a refresh therefore takes noticeably longer than
//! one that does not. [`RefreshTimer`] learns the latency that separates the
//! two cases and uses it to spin until the next refresh edge.

use crate::hammerer::RefreshSync;
use crate::memory::{AggressorPtr, DRAMAddr, MemConfiguration};
use crate::util::median;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::arch::asm;
use std::arch::x86_64::{__rdtscp, _mm_lfence, _mm_mfence};
use thiserror::Error;

/// Latencies above `mean * PEAK_DECISION_MULTIPLIER` count as refresh peaks.
pub const PEAK_DECISION_MULTIPLIER: f64 = 1.02;

/// Calibration gives up after this many rounds.
pub const MAX_CALIBRATION_ROUNDS: usize = 30;

/// Measurements after which a bounded refresh wait gives up.
pub const MAX_SYNC_MEASUREMENTS: u64 = 100_000;

/// Number of rows at the top of each bank reserved for refresh synchronization.
pub const SYNC_ROW_RESERVE: usize = 1;

/// A single timed memory access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Measurement {
    /// Access latency in cycles
    pub timing: u64,
    /// Timestamp at which the access started
    pub timestamp: u64,
}

/// Times a single uncached memory access.
pub trait AccessTimer {
    /// Flushes `addr`, loads it and returns the load latency.
    ///
    /// # Safety
    ///
    /// `addr` must be valid for reads, unless the implementation never
    /// dereferences it.
    unsafe fn measure(&self, addr: AggressorPtr) -> Measurement;
}

/// [`AccessTimer`] based on `rdtscp`.
#[derive(Clone, Copy, Debug, Default)]
pub struct RdtscpTimer;

impl AccessTimer for RdtscpTimer {
    unsafe fn measure(&self, addr: AggressorPtr) -> Measurement {
        let mut aux = 0;
        unsafe {
            asm!("clflushopt [{}]", in(reg) addr);
            _mm_mfence();
            _mm_lfence();
            let start = __rdtscp(&mut aux);
            _mm_lfence();
            std::ptr::read_volatile(addr);
            _mm_mfence();
            let end = __rdtscp(&mut aux);
            Measurement {
                timing: end - start,
                timestamp: start,
            }
        }
    }
}

/// Result of a refresh calibration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calibration {
    /// Latency at or above which an access is attributed to a refresh
    pub threshold: u64,
    /// Median distance between refresh peaks in cycles
    pub cycles_per_refresh: u64,
    /// Median number of accesses between refresh peaks
    pub acts_per_refresh: u64,
    /// Rounds needed until two estimates agreed
    pub rounds: usize,
}

/// Errors of the refresh timer.
#[derive(Debug, Error)]
pub enum TimerError {
    /// Threshold estimates did not settle
    #[error("refresh calibration did not converge after {0} rounds")]
    CalibrationFailed(usize),
    /// A calibration round needs at least one sample
    #[error("calibration needs at least one sample per round")]
    NoSamples,
    /// A zero threshold never separates refreshes from ordinary accesses
    #[error("refresh threshold must be above zero")]
    ZeroThreshold,
}

/// Refresh edge detector for all banks of the target region.
///
/// Each bank owns one synchronization address in its topmost row. Those rows
/// are never handed out to patterns.
#[derive(Debug)]
pub struct RefreshTimer<T> {
    timer: T,
    sync_addrs: Vec<usize>,
    samples: usize,
    calibration: Calibration,
}

impl<T: AccessTimer> RefreshTimer<T> {
    /// Measures the refresh threshold on the sync row of bank 0.
    ///
    /// `base` is any address inside the 1 GiB region the sync rows are placed in.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::CalibrationFailed`] if the estimate does not
    /// settle within [`MAX_CALIBRATION_ROUNDS`].
    pub fn calibrate(
        timer: T,
        base: AggressorPtr,
        mem_config: &MemConfiguration,
        samples: usize,
    ) -> Result<Self, TimerError> {
        if samples == 0 {
            return Err(TimerError::NoSamples);
        }
        let mut this = RefreshTimer {
            timer,
            sync_addrs: sync_addrs(base, mem_config),
            samples,
            calibration: Calibration {
                threshold: 0,
                cycles_per_refresh: 0,
                acts_per_refresh: 0,
                rounds: 0,
            },
        };
        this.reanalyze()?;
        Ok(this)
    }

    /// Reuses an earlier calibration without measuring.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::ZeroThreshold`] if the calibration has a zero threshold.
    pub fn from_calibration(
        timer: T,
        base: AggressorPtr,
        mem_config: &MemConfiguration,
        calibration: Calibration,
    ) -> Result<Self, TimerError> {
        if calibration.threshold == 0 {
            return Err(TimerError::ZeroThreshold);
        }
        Ok(RefreshTimer {
            timer,
            sync_addrs: sync_addrs(base, mem_config),
            samples: 0,
            calibration,
        })
    }

    /// Repeats the calibration until two consecutive estimates agree within 10%.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::CalibrationFailed`] after [`MAX_CALIBRATION_ROUNDS`].
    pub fn reanalyze(&mut self) -> Result<Calibration, TimerError> {
        if self.samples == 0 {
            return Err(TimerError::NoSamples);
        }
        let addr = self.sync_addrs[0] as AggressorPtr;
        let mut previous: Option<u64> = None;
        for round in 1..=MAX_CALIBRATION_ROUNDS {
            for _ in 0..self.samples / 10 {
                unsafe { self.timer.measure(addr) };
            }
            unsafe { libc::sched_yield() };

            let measurements = (0..self.samples)
                .map(|_| unsafe { self.timer.measure(addr) })
                .collect::<Vec<_>>();
            let Some(estimate) = analyze_round(&measurements).filter(|c| c.threshold > 0) else {
                debug!("calibration round {}: no refresh peaks", round);
                previous = None;
                continue;
            };
            debug!(
                "calibration round {}: threshold {}, {} cycles per refresh",
                round, estimate.threshold, estimate.cycles_per_refresh
            );
            let converged = previous
                .is_some_and(|prev| estimate.threshold.abs_diff(prev) <= prev / 10);
            previous = Some(estimate.threshold);
            if converged {
                self.calibration = Calibration {
                    rounds: round,
                    ..estimate
                };
                info!(
                    "refresh threshold {} cycles, {} cycles / {} accesses per refresh",
                    self.calibration.threshold,
                    self.calibration.cycles_per_refresh,
                    self.calibration.acts_per_refresh
                );
                return Ok(self.calibration);
            }
        }
        Err(TimerError::CalibrationFailed(MAX_CALIBRATION_ROUNDS))
    }

    /// Spins until an access to the sync row of `bank` hits a refresh.
    ///
    /// Returns the number of measurements taken.
    pub fn wait_for_refresh(&self, bank: usize) -> u64 {
        let sync = self.sync(bank);
        // sync rows lie inside the region; the threshold is never zero
        let wait = unsafe { sync.wait(&self.timer, None) };
        if wait.outliers > 0 {
            debug!(
                "bank {}: {} accesses above {} cycles while waiting for a refresh",
                bank,
                wait.outliers,
                sync.upper_bound()
            );
        }
        wait.measurements
    }

    /// Refresh synchronization target of `bank`.
    pub fn sync(&self, bank: usize) -> RefreshSync {
        RefreshSync {
            addr: self.sync_addr(bank),
            threshold: self.calibration.threshold,
        }
    }

    /// The sync address of `bank`.
    pub fn sync_addr(&self, bank: usize) -> usize {
        self.sync_addrs[bank % self.sync_addrs.len()]
    }

    /// The current calibration.
    pub fn calibration(&self) -> Calibration {
        self.calibration
    }

    /// The current refresh threshold in cycles.
    pub fn threshold(&self) -> u64 {
        self.calibration.threshold
    }
}

fn sync_addrs(base: AggressorPtr, mem_config: &MemConfiguration) -> Vec<usize> {
    let row = mem_config.get_row_count() - SYNC_ROW_RESERVE;
    (0..mem_config.get_bank_count())
        .map(|bank| DRAMAddr::new(bank, row, 0).to_virt(base, mem_config) as usize)
        .collect()
}

/// Derives threshold and refresh period from one round of measurements.
///
/// Returns `None` if no measurement stands out as a peak.
fn analyze_round(measurements: &[Measurement]) -> Option<Calibration> {
    if measurements.is_empty() {
        return None;
    }
    let mean = measurements.iter().map(|m| m.timing as f64).sum::<f64>()
        / measurements.len() as f64;
    let peaks = measurements
        .iter()
        .enumerate()
        .filter(|(_, m)| m.timing as f64 > mean * PEAK_DECISION_MULTIPLIER)
        .collect::<Vec<_>>();
    let mut peak_timings = peaks.iter().map(|(_, m)| m.timing).collect::<Vec<_>>();
    let peak_median = median(&mut peak_timings)?;
    let mut cycle_deltas = peaks
        .windows(2)
        .map(|w| w[1].1.timestamp.saturating_sub(w[0].1.timestamp))
        .collect::<Vec<_>>();
    let mut index_deltas = peaks
        .windows(2)
        .map(|w| (w[1].0 - w[0].0) as u64)
        .collect::<Vec<_>>();
    let threshold = mean + (peak_median as f64 - mean) / 2.0;
    Some(Calibration {
        threshold: threshold as u64,
        cycles_per_refresh: median(&mut cycle_deltas).unwrap_or(0),
        acts_per_refresh: median(&mut index_deltas).unwrap_or(0),
        rounds: 1,
    })
}

#[cfg(test)]
mod tests {
    use super::{AccessTimer, Measurement, RefreshTimer, TimerError};
    use crate::memory::{AggressorPtr, DramProfile, MemConfiguration};
    use crate::util::BASE_MSB;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Baseline latency with a periodic peak, on a logical clock.
    struct PeriodicTimer {
        calls: AtomicU64,
        baseline: u64,
        peak: u64,
        period: u64,
    }

    impl PeriodicTimer {
        fn new(baseline: u64, peak: u64, period: u64) -> Self {
            PeriodicTimer {
                calls: AtomicU64::new(0),
                baseline,
                peak,
                period,
            }
        }
    }

    impl AccessTimer for PeriodicTimer {
        unsafe fn measure(&self, _addr: AggressorPtr) -> Measurement {
            let n = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
            let timing = if self.period > 0 && n % self.period == 0 {
                self.peak
            } else {
                self.baseline
            };
            Measurement {
                timing,
                timestamp: n * 100,
            }
        }
    }

    fn mem_config() -> MemConfiguration {
        let profile = DramProfile::from_jsonfile(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../../config/bs-config.json"
        ))
        .expect("profile");
        MemConfiguration::from_bitdefs(profile.bank_bits, profile.row_bits, profile.col_bits)
            .expect("invertible")
    }

    #[test]
    fn test_calibration_converges() {
        let _ = env_logger::builder().is_test(true).try_init();
        let timer = PeriodicTimer::new(200, 400, 50);
        let refresh =
            RefreshTimer::calibrate(timer, BASE_MSB as AggressorPtr, &mem_config(), 10_000)
                .expect("calibration");
        let c = refresh.calibration();
        assert_eq!(c.threshold, 302);
        assert_eq!(c.cycles_per_refresh, 5000);
        assert_eq!(c.acts_per_refresh, 50);
        assert_eq!(c.rounds, 2);
    }

    #[test]
    fn test_calibration_fails_without_peaks() {
        let timer = PeriodicTimer::new(200, 200, 0);
        let res = RefreshTimer::calibrate(timer, BASE_MSB as AggressorPtr, &mem_config(), 1_000);
        assert!(matches!(res, Err(TimerError::CalibrationFailed(30))));
    }

    #[test]
    fn test_wait_for_refresh() {
        let cfg = mem_config();
        let refresh = RefreshTimer::calibrate(
            PeriodicTimer::new(200, 400, 50),
            BASE_MSB as AggressorPtr,
            &cfg,
            10_000,
        )
        .expect("calibration");
        let calls = refresh.timer.calls.load(Ordering::Relaxed);
        let waited = refresh.wait_for_refresh(3);
        assert!(waited >= 1 && waited <= 50);
        assert_eq!((calls + waited) % 50, 0);
    }

    #[test]
    fn test_wait_skips_outliers() {
        // every 10th access is a stall far above the refresh latency
        struct Outliers(AtomicU64);
        impl AccessTimer for Outliers {
            unsafe fn measure(&self, _addr: AggressorPtr) -> Measurement {
                let n = self.0.fetch_add(1, Ordering::Relaxed) + 1;
                let timing = match n {
                    n if n % 25 == 0 => 400,
                    n if n % 10 == 0 => 5000,
                    _ => 200,
                };
                Measurement {
                    timing,
                    timestamp: n,
                }
            }
        }
        let cfg = mem_config();
        let refresh = RefreshTimer::from_calibration(
            Outliers(AtomicU64::new(0)),
            BASE_MSB as AggressorPtr,
            &cfg,
            super::Calibration {
                threshold: 300,
                cycles_per_refresh: 25,
                acts_per_refresh: 25,
                rounds: 1,
            },
        )
        .expect("timer");
        assert_eq!(refresh.wait_for_refresh(0), 25);
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let calibration = super::Calibration {
            threshold: 0,
            cycles_per_refresh: 25,
            acts_per_refresh: 25,
            rounds: 1,
        };
        let res = RefreshTimer::from_calibration(
            PeriodicTimer::new(0, 0, 0),
            BASE_MSB as AggressorPtr,
            &mem_config(),
            calibration,
        );
        assert!(matches!(res, Err(TimerError::ZeroThreshold)));

        // one-cycle peaks over a zero baseline estimate a threshold of zero
        let res = RefreshTimer::calibrate(
            PeriodicTimer::new(0, 1, 50),
            BASE_MSB as AggressorPtr,
            &mem_config(),
            1_000,
        );
        assert!(matches!(res, Err(TimerError::CalibrationFailed(_))));
    }

    #[test]
    fn test_sync_rows_top_of_bank() {
        let cfg = mem_config();
        let refresh = RefreshTimer::from_calibration(
            PeriodicTimer::new(1, 1, 0),
            BASE_MSB as AggressorPtr,
            &cfg,
            super::Calibration {
                threshold: 1,
                cycles_per_refresh: 1,
                acts_per_refresh: 1,
                rounds: 1,
            },
        )
        .expect("timer");
        for bank in 0..cfg.get_bank_count() {
            let dram = crate::memory::DRAMAddr::from_virt(
                refresh.sync_addr(bank) as AggressorPtr,
                &cfg,
            );
            assert_eq!(dram.bank, bank);
            assert_eq!(dram.row, cfg.get_row_count() - 1);
        }
    }
}
