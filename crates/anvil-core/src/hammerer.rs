//! Hammering kernel traits.
//!
//! This module defines the [`HammerKernel`] trait that kernel implementations must implement
//! to turn an exported access sequence into a runnable hammering loop. The
//! `anvil-jit` crate emits native code; `anvil-interp` runs the same loop in Rust.

use crate::memory::{AccessTimer, AggressorPtr};
use crate::pattern::{FencingStrategy, FenceType, FlushingStrategy};
use serde::Serialize;
use std::collections::HashSet;

/// With [`FencingStrategy::LatestPossible`], every this many row accesses are
/// preceded by a fence.
pub const SERIALIZE_EACH_N: usize = 16;

/// One entry of an exported access sequence.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    /// Load from this virtual address
    Row(usize),
    /// Explicit fence marker
    Fence,
}

impl Access {
    /// The address of a row access.
    pub fn addr(&self) -> Option<usize> {
        match self {
            Access::Row(addr) => Some(*addr),
            Access::Fence => None,
        }
    }
}

/// Refresh synchronization target: a sync row address and the timing
/// threshold that marks a refresh.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSync {
    /// Virtual address of the sync row
    pub addr: usize,
    /// Access time at or above which a refresh is assumed
    pub threshold: u64,
}

impl RefreshSync {
    /// Measurements above this bound are treated as noise.
    pub fn upper_bound(&self) -> u64 {
        self.threshold.saturating_mul(3)
    }

    /// Measures the sync row with `timer` until one access lands in
    /// `threshold..=upper_bound()`, or until `limit` measurements were taken.
    ///
    /// Without a limit and with a zero threshold this only returns on a
    /// zero-latency access.
    ///
    /// # Safety
    ///
    /// [`Self::addr`] must be valid for reads.
    pub unsafe fn wait<T: AccessTimer + ?Sized>(
        &self,
        timer: &T,
        limit: Option<u64>,
    ) -> SyncWait {
        let window = self.threshold..=self.upper_bound();
        let mut wait = SyncWait::default();
        while limit.is_none_or(|limit| wait.measurements < limit) {
            let m = unsafe { timer.measure(self.addr as AggressorPtr) };
            wait.measurements += 1;
            if window.contains(&m.timing) {
                wait.hit = true;
                break;
            }
            if m.timing > *window.end() {
                wait.outliers += 1;
            }
        }
        wait
    }
}

/// Outcome of one [`RefreshSync::wait`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncWait {
    /// Measurements taken
    pub measurements: u64,
    /// Measurements above the upper bound
    pub outliers: u64,
    /// An access landed in the refresh window
    pub hit: bool,
}

/// Everything a kernel needs to emit the hammering loop.
#[derive(Serialize, Debug, Clone)]
pub struct AccessLoop {
    /// Accesses of one loop iteration
    pub accesses: Vec<Access>,
    /// Row activations after which the loop stops
    pub activations: usize,
    /// Flush placement
    pub flushing: FlushingStrategy,
    /// Fence placement
    pub fencing: FencingStrategy,
    /// Instruction used for fence markers
    pub fence_type: FenceType,
    /// Wait for a refresh at the start of every iteration
    pub sync_each_iteration: bool,
}

impl AccessLoop {
    /// Number of row accesses in one iteration.
    pub fn rows_per_iteration(&self) -> usize {
        self.accesses
            .iter()
            .filter(|a| matches!(a, Access::Row(_)))
            .count()
    }
}

/// One instruction of a lowered access loop body.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelOp {
    /// Load from the address
    Load(usize),
    /// Flush the cache line of the address
    Flush(usize),
    /// Serialize with the given fence
    Fence(FenceType),
}

impl AccessLoop {
    /// Lowers one iteration into loads, flushes and fences.
    ///
    /// Both kernels execute exactly this body, so flush and fence placement
    /// does not depend on the kernel:
    ///
    /// * `EarliestPossible` flushing flushes right after a load,
    ///   `LatestPossible` right before the next load of an address already
    ///   loaded in this iteration.
    /// * `EarliestPossible` fencing adds an `mfence` after every flush,
    ///   `LatestPossible` one before every [`SERIALIZE_EACH_N`]th load.
    /// * A run of consecutive fence markers becomes a single `fence_type`
    ///   fence. [`FenceType::NoFence`] drops the markers.
    pub fn lower(&self) -> Vec<KernelOp> {
        let mut ops = Vec::with_capacity(self.accesses.len() * 3);
        let fence_after_flush = self.fencing == FencingStrategy::EarliestPossible;
        let mut in_fence_run = false;
        let mut loads = 0;
        let mut seen = HashSet::new();
        for access in &self.accesses {
            let addr = match access {
                Access::Fence => {
                    if !in_fence_run && self.fence_type != FenceType::NoFence {
                        ops.push(KernelOp::Fence(self.fence_type));
                    }
                    in_fence_run = true;
                    continue;
                }
                Access::Row(addr) => *addr,
            };
            in_fence_run = false;
            let seen_before = !seen.insert(addr);
            if self.flushing == FlushingStrategy::LatestPossible && seen_before {
                ops.push(KernelOp::Flush(addr));
                if fence_after_flush {
                    ops.push(KernelOp::Fence(FenceType::Mfence));
                }
            }
            if self.fencing == FencingStrategy::LatestPossible && loads % SERIALIZE_EACH_N == 1 {
                ops.push(KernelOp::Fence(FenceType::Mfence));
            }
            ops.push(KernelOp::Load(addr));
            if self.flushing == FlushingStrategy::EarliestPossible {
                ops.push(KernelOp::Flush(addr));
                if fence_after_flush {
                    ops.push(KernelOp::Fence(FenceType::Mfence));
                }
            }
            loads += 1;
        }
        ops
    }
}

/// Result of one kernel run.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelRun {
    /// Elapsed timestamp counter cycles
    pub cycles: u64,
}

/// Trait for hammering kernels.
///
/// A kernel is built for exactly one access sequence: first the optional
/// refresh sync is emitted, then the access loop, then it is run and finally
/// released. Kernels are never reused across sequences.
///
/// # Associated Types
///
/// * `Error` - The error type returned by kernel operations. Must implement [`std::error::Error`].
///
/// # Examples
///
/// See the `anvil-jit` and `anvil-interp` crates for implementations.
pub trait HammerKernel {
    /// The error type returned by kernel operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Emits a refresh sync prologue. Only takes effect if the access loop
    /// is emitted with `sync_each_iteration`.
    ///
    /// # Errors
    ///
    /// Returns an error if emission fails or the loop was already emitted.
    fn emit_refresh_sync(&mut self, sync: RefreshSync) -> Result<(), Self::Error>;

    /// Emits the hammering loop.
    ///
    /// # Errors
    ///
    /// Returns an error if emission fails or the sequence contains no row access.
    fn emit_access_loop(&mut self, access_loop: &AccessLoop) -> Result<(), Self::Error>;

    /// Runs the emitted loop.
    ///
    /// # Errors
    ///
    /// Returns an error if nothing was emitted.
    fn run(&mut self) -> Result<KernelRun, Self::Error>;

    /// Releases the emitted code.
    fn release(&mut self);
}

#[cfg(test)]
mod tests {
    use super::{Access, AccessLoop, KernelOp, RefreshSync, SyncWait};
    use crate::memory::{AccessTimer, AggressorPtr, Measurement};
    use crate::pattern::{FencingStrategy, FenceType, FlushingStrategy};
    use std::cell::Cell;

    /// Replays `timings` in a cycle.
    struct Replay {
        timings: Vec<u64>,
        calls: Cell<usize>,
    }

    impl AccessTimer for Replay {
        unsafe fn measure(&self, _addr: AggressorPtr) -> Measurement {
            let n = self.calls.get();
            self.calls.set(n + 1);
            Measurement {
                timing: self.timings[n % self.timings.len()],
                timestamp: n as u64,
            }
        }
    }

    fn access_loop(
        accesses: Vec<Access>,
        flushing: FlushingStrategy,
        fencing: FencingStrategy,
        fence_type: FenceType,
    ) -> AccessLoop {
        AccessLoop {
            accesses,
            activations: 100,
            flushing,
            fencing,
            fence_type,
            sync_each_iteration: false,
        }
    }

    #[test]
    fn test_lower_flushing() {
        use KernelOp::*;
        let accesses = vec![Access::Row(1), Access::Fence, Access::Fence, Access::Row(2)];
        let early = access_loop(
            accesses.clone(),
            FlushingStrategy::EarliestPossible,
            FencingStrategy::OmitFencing,
            FenceType::Lfence,
        );
        assert_eq!(
            early.lower(),
            [Load(1), Flush(1), Fence(FenceType::Lfence), Load(2), Flush(2)]
        );
        let late = access_loop(
            vec![Access::Row(1), Access::Fence, Access::Row(2), Access::Row(1)],
            FlushingStrategy::LatestPossible,
            FencingStrategy::OmitFencing,
            FenceType::NoFence,
        );
        assert_eq!(late.lower(), [Load(1), Load(2), Flush(1), Load(1)]);
        let fenced = access_loop(
            accesses,
            FlushingStrategy::EarliestPossible,
            FencingStrategy::EarliestPossible,
            FenceType::NoFence,
        );
        assert_eq!(
            fenced.lower(),
            [
                Load(1),
                Flush(1),
                Fence(FenceType::Mfence),
                Load(2),
                Flush(2),
                Fence(FenceType::Mfence)
            ]
        );
    }

    #[test]
    fn test_lower_periodic_fence() {
        let l = access_loop(
            (0..40).map(Access::Row).collect(),
            FlushingStrategy::EarliestPossible,
            FencingStrategy::LatestPossible,
            FenceType::Mfence,
        );
        let ops = l.lower();
        let fences = ops
            .iter()
            .filter(|op| matches!(op, KernelOp::Fence(_)))
            .count();
        // before loads 1, 17 and 33
        assert_eq!(fences, 3);
        assert_eq!(ops[2], KernelOp::Fence(FenceType::Mfence));
        assert_eq!(ops[3], KernelOp::Load(1));
    }

    #[test]
    fn test_access_loop_rows() {
        let l = AccessLoop {
            accesses: vec![Access::Row(0x1000), Access::Fence, Access::Row(0x2000)],
            activations: 10,
            flushing: FlushingStrategy::EarliestPossible,
            fencing: FencingStrategy::OmitFencing,
            fence_type: FenceType::Mfence,
            sync_each_iteration: false,
        };
        assert_eq!(l.rows_per_iteration(), 2);
        assert_eq!(l.accesses[1].addr(), None);
        assert_eq!(l.accesses[2].addr(), Some(0x2000));
        assert_eq!(RefreshSync { addr: 0, threshold: 100 }.upper_bound(), 300);
    }

    #[test]
    fn test_sync_wait() {
        let sync = RefreshSync {
            addr: 0,
            threshold: 100,
        };
        let timer = Replay {
            timings: vec![50, 900, 60, 301, 250],
            calls: Cell::new(0),
        };
        let wait = unsafe { sync.wait(&timer, None) };
        assert_eq!(
            wait,
            SyncWait {
                measurements: 5,
                outliers: 2,
                hit: true
            }
        );

        // the limit stops a wait that never sees a refresh
        let quiet = Replay {
            timings: vec![50],
            calls: Cell::new(0),
        };
        let wait = unsafe { sync.wait(&quiet, Some(1000)) };
        assert!(!wait.hit);
        assert_eq!(wait.measurements, 1000);
        assert_eq!(quiet.calls.get(), 1000);
    }
}
