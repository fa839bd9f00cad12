use anvil_core::hammerer::{AccessLoop, HammerKernel, KernelOp, KernelRun, RefreshSync};
use anvil_core::memory::{MAX_SYNC_MEASUREMENTS, RdtscpTimer};
use anvil_core::pattern::FenceType;
use log::{debug, trace};
use std::arch::x86_64::{__rdtscp, _mm_clflush, _mm_lfence, _mm_mfence, _mm_sfence};
use thiserror::Error;

/// Errors of the interpreted kernel.
#[derive(Debug, Error)]
pub enum InterpError {
    /// The sequence has no row access
    #[error("access sequence contains no row access")]
    EmptySequence,
    /// `run` before `emit_access_loop`
    #[error("no access loop emitted")]
    NotEmitted,
    /// The kernel already holds a loop
    #[error("access loop already emitted")]
    AlreadyEmitted,
}

#[derive(Debug)]
struct Emitted {
    ops: Vec<KernelOp>,
    rows: usize,
    activations: usize,
    sync: Option<RefreshSync>,
}

/// Hammering kernel that interprets the lowered access loop.
#[derive(Debug, Default)]
pub struct InterpKernel {
    sync: Option<RefreshSync>,
    emitted: Option<Emitted>,
    sync_misses: usize,
}

impl InterpKernel {
    /// Creates an empty kernel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Body of one loop iteration, empty before emission.
    pub fn ops(&self) -> &[KernelOp] {
        self.emitted.as_ref().map_or(&[], |e| &e.ops)
    }

    /// Refresh waits of the last run that gave up after
    /// [`MAX_SYNC_MEASUREMENTS`].
    pub fn sync_misses(&self) -> usize {
        self.sync_misses
    }
}

impl HammerKernel for InterpKernel {
    type Error = InterpError;

    fn emit_refresh_sync(&mut self, sync: RefreshSync) -> Result<(), Self::Error> {
        if self.emitted.is_some() {
            return Err(InterpError::AlreadyEmitted);
        }
        self.sync = Some(sync);
        Ok(())
    }

    fn emit_access_loop(&mut self, access_loop: &AccessLoop) -> Result<(), Self::Error> {
        if self.emitted.is_some() {
            return Err(InterpError::AlreadyEmitted);
        }
        let rows = access_loop.rows_per_iteration();
        if rows == 0 {
            return Err(InterpError::EmptySequence);
        }
        let ops = access_loop.lower();
        debug!("interpreting {} ops, {} rows per iteration", ops.len(), rows);
        self.emitted = Some(Emitted {
            ops,
            rows,
            activations: access_loop.activations,
            sync: self.sync.filter(|_| access_loop.sync_each_iteration),
        });
        Ok(())
    }

    fn run(&mut self) -> Result<KernelRun, Self::Error> {
        let emitted = self.emitted.as_ref().ok_or(InterpError::NotEmitted)?;
        self.sync_misses = 0;
        let mut aux = 0;
        let start = unsafe { __rdtscp(&mut aux) };
        let mut activations = 0;
        while activations < emitted.activations {
            if let Some(sync) = emitted.sync {
                // the sync row was exported from the live allocation
                let wait = unsafe { sync.wait(&RdtscpTimer, Some(MAX_SYNC_MEASUREMENTS)) };
                if !wait.hit {
                    self.sync_misses += 1;
                }
            }
            for op in &emitted.ops {
                // addresses were exported from the live allocation
                unsafe { execute(*op) };
            }
            activations += emitted.rows;
        }
        let cycles = unsafe { __rdtscp(&mut aux) } - start;
        if self.sync_misses > 0 {
            trace!("{} refresh waits gave up", self.sync_misses);
        }
        Ok(KernelRun { cycles })
    }

    fn release(&mut self) {
        self.emitted = None;
        self.sync = None;
    }
}

unsafe fn execute(op: KernelOp) {
    unsafe {
        match op {
            KernelOp::Load(addr) => {
                std::ptr::read_volatile(addr as *const u64);
            }
            KernelOp::Flush(addr) => _mm_clflush(addr as *const u8),
            KernelOp::Fence(FenceType::NoFence) => {}
            KernelOp::Fence(FenceType::Mfence) => _mm_mfence(),
            KernelOp::Fence(FenceType::Lfence) => _mm_lfence(),
            KernelOp::Fence(FenceType::Sfence) => _mm_sfence(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{InterpError, InterpKernel};
    use anvil_core::hammerer::{Access, AccessLoop, HammerKernel, KernelOp, RefreshSync};
    use anvil_core::pattern::{FenceType, FencingStrategy, FlushingStrategy};

    fn access_loop(addrs: &[usize], activations: usize) -> AccessLoop {
        AccessLoop {
            accesses: addrs.iter().map(|&a| Access::Row(a)).collect(),
            activations,
            flushing: FlushingStrategy::EarliestPossible,
            fencing: FencingStrategy::OmitFencing,
            fence_type: FenceType::Mfence,
            sync_each_iteration: false,
        }
    }

    #[test]
    fn test_lifecycle() {
        let _ = env_logger::builder().is_test(true).try_init();
        let buf = vec![0u64; 32];
        let addrs = [&buf[0] as *const u64 as usize, &buf[16] as *const u64 as usize];
        let mut kernel = InterpKernel::new();
        assert!(matches!(kernel.run(), Err(InterpError::NotEmitted)));
        assert!(matches!(
            kernel.emit_access_loop(&access_loop(&[], 10)),
            Err(InterpError::EmptySequence)
        ));
        kernel.emit_access_loop(&access_loop(&addrs, 1001)).expect("emit");
        assert_eq!(
            kernel.ops(),
            [
                KernelOp::Load(addrs[0]),
                KernelOp::Flush(addrs[0]),
                KernelOp::Load(addrs[1]),
                KernelOp::Flush(addrs[1]),
            ]
        );
        assert!(matches!(
            kernel.emit_refresh_sync(RefreshSync {
                addr: addrs[0],
                threshold: 1
            }),
            Err(InterpError::AlreadyEmitted)
        ));
        let run = kernel.run().expect("run");
        assert!(run.cycles > 0);
        kernel.release();
        assert!(kernel.ops().is_empty());
    }

    #[test]
    fn test_unreachable_refresh_gives_up() {
        let buf = vec![0u64; 8];
        let addr = buf.as_ptr() as usize;
        let mut kernel = InterpKernel::new();
        kernel
            .emit_refresh_sync(RefreshSync {
                addr,
                threshold: u64::MAX / 4,
            })
            .expect("sync");
        kernel
            .emit_access_loop(&AccessLoop {
                sync_each_iteration: true,
                ..access_loop(&[addr], 2)
            })
            .expect("emit");
        kernel.run().expect("run");
        assert_eq!(kernel.sync_misses(), 2);
    }
}
