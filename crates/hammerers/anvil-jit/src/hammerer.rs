use crate::jitter::{Program, assemble};
use anvil_core::hammerer::{AccessLoop, HammerKernel, KernelRun, RefreshSync};
use iced_x86::IcedError;
use log::{debug, info};
use thiserror::Error;

/// File the emitted code is written to with the `jitter_dump` feature.
pub const JIT_DUMP_FILE: &str = "hammer_jit.o";

/// Errors of the JIT kernel.
#[derive(Debug, Error)]
pub enum JitError {
    /// The assembler rejected an instruction
    #[error(transparent)]
    Asm(#[from] IcedError),
    /// Mapping, protecting or dumping the code failed
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The sequence has no row access
    #[error("access sequence contains no row access")]
    EmptySequence,
    /// `run` before `emit_access_loop`
    #[error("no code emitted")]
    NotEmitted,
    /// The kernel already holds code
    #[error("code already emitted")]
    AlreadyEmitted,
}

/// Hammering kernel that compiles the access loop to native code.
///
/// The code is built by [`HammerKernel::emit_access_loop`] and unmapped by
/// [`HammerKernel::release`]. A released kernel can be emitted again.
#[derive(Debug, Default)]
pub struct JitKernel {
    sync: Option<RefreshSync>,
    program: Option<Program>,
}

impl JitKernel {
    /// Creates an empty kernel.
    pub fn new() -> Self {
        Self::default()
    }

    /// The emitted program, if any.
    pub fn program(&self) -> Option<&Program> {
        self.program.as_ref()
    }
}

impl HammerKernel for JitKernel {
    type Error = JitError;

    fn emit_refresh_sync(&mut self, sync: RefreshSync) -> Result<(), Self::Error> {
        if self.program.is_some() {
            return Err(JitError::AlreadyEmitted);
        }
        self.sync = Some(sync);
        Ok(())
    }

    fn emit_access_loop(&mut self, access_loop: &AccessLoop) -> Result<(), Self::Error> {
        if self.program.is_some() {
            return Err(JitError::AlreadyEmitted);
        }
        if access_loop.rows_per_iteration() == 0 {
            return Err(JitError::EmptySequence);
        }
        let bytes = assemble(access_loop, self.sync)?;
        let program = Program::new(&bytes)?;
        if cfg!(feature = "jitter_dump") {
            program.write(JIT_DUMP_FILE)?;
            info!("wrote {} bytes of code to {}", program.len(), JIT_DUMP_FILE);
        }
        self.program = Some(program);
        Ok(())
    }

    fn run(&mut self) -> Result<KernelRun, Self::Error> {
        let program = self.program.as_ref().ok_or(JitError::NotEmitted)?;
        // addresses were exported from the live allocation
        let cycles = unsafe { program.call() };
        debug!("jit call done after {} cycles", cycles);
        Ok(KernelRun { cycles })
    }

    fn release(&mut self) {
        self.program = None;
        self.sync = None;
    }
}

#[cfg(test)]
mod tests {
    use super::{JitError, JitKernel};
    use anvil_core::hammerer::{Access, AccessLoop, HammerKernel, RefreshSync};
    use anvil_core::pattern::{FenceType, FencingStrategy, FlushingStrategy};

    fn access_loop(buf: &[u64], activations: usize) -> AccessLoop {
        AccessLoop {
            accesses: buf
                .iter()
                .step_by(8)
                .map(|x| Access::Row(x as *const u64 as usize))
                .flat_map(|a| [a, Access::Fence])
                .collect(),
            activations,
            flushing: FlushingStrategy::EarliestPossible,
            fencing: FencingStrategy::LatestPossible,
            fence_type: FenceType::Mfence,
            sync_each_iteration: false,
        }
    }

    #[test]
    fn test_emit_and_release() {
        let buf = vec![0u64; 64];
        let mut kernel = JitKernel::new();
        assert!(matches!(kernel.run(), Err(JitError::NotEmitted)));
        kernel
            .emit_refresh_sync(RefreshSync {
                addr: buf.as_ptr() as usize,
                threshold: 300,
            })
            .expect("sync");
        kernel.emit_access_loop(&access_loop(&buf, 1000)).expect("emit");
        assert!(kernel.program().is_some_and(|p| !p.is_empty()));
        assert!(matches!(
            kernel.emit_access_loop(&access_loop(&buf, 1000)),
            Err(JitError::AlreadyEmitted)
        ));
        kernel.release();
        assert!(kernel.program().is_none());
        assert!(matches!(
            kernel.emit_access_loop(&AccessLoop {
                accesses: vec![Access::Fence],
                ..access_loop(&buf, 10)
            }),
            Err(JitError::EmptySequence)
        ));
    }

    #[test]
    fn test_run() {
        // CPUID.(EAX=07H,ECX=0):EBX[bit 23] = CLFLUSHOPT
        if std::arch::x86_64::__cpuid_count(7, 0).ebx & (1 << 23) == 0 {
            return;
        }
        let buf = vec![0u64; 64];
        let mut kernel = JitKernel::new();
        kernel.emit_access_loop(&access_loop(&buf, 10_000)).expect("emit");
        let run = kernel.run().expect("run");
        assert!(run.cycles > 0);
        kernel.release();
    }
}
