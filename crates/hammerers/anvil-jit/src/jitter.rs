use anvil_core::hammerer::{AccessLoop, KernelOp, RefreshSync};
use anvil_core::pattern::FenceType;
use iced_x86::IcedError;
use iced_x86::code_asm::*;
use log::{debug, trace};
use memmap2::{Mmap, MmapMut};
use std::path::Path;

/// Executable machine code of one access loop.
#[derive(Debug)]
pub struct Program {
    code: Mmap,
}

impl Program {
    /// Maps `bytes` into fresh executable memory.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the mapping cannot be created or made executable.
    pub fn new(bytes: &[u8]) -> std::io::Result<Self> {
        let mut map = MmapMut::map_anon(bytes.len())?;
        map.copy_from_slice(bytes);
        Ok(Program {
            code: map.make_exec()?,
        })
    }

    /// Runs the program and returns the cycles spent in the loop.
    ///
    /// # Safety
    ///
    /// Every address the program was assembled with must be mapped and
    /// readable.
    pub unsafe fn call(&self) -> u64 {
        let f: extern "C" fn() -> u64 = unsafe { std::mem::transmute(self.code.as_ptr()) };
        f()
    }

    /// Writes the raw machine code to `path`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if writing fails.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        std::fs::write(path, &self.code[..])
    }

    /// Code size in bytes.
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Returns true if the program holds no code.
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}

/// Assembles `access_loop` into a function `extern "C" fn() -> u64`.
///
/// Register use, all caller-saved:
/// `rsi` counts activations, `r10` holds the start timestamp,
/// `r11d` the low half of the sync timestamp and `rax`, `rcx`, `rdx` are scratch.
pub(crate) fn assemble(
    access_loop: &AccessLoop,
    sync: Option<RefreshSync>,
) -> Result<Vec<u8>, IcedError> {
    let ops = access_loop.lower();
    let rows = access_loop.rows_per_iteration();
    let mut a = CodeAssembler::new(64)?;

    a.xor(rsi, rsi)?;
    timestamp(&mut a)?;
    a.mov(r10, rdx)?;

    let mut loop_start = a.create_label();
    a.set_label(&mut loop_start)?;
    if let (true, Some(sync)) = (access_loop.sync_each_iteration, sync) {
        ref_sync(&mut a, sync)?;
    }
    for op in &ops {
        match *op {
            KernelOp::Load(addr) => {
                a.mov(rax, addr as u64)?;
                a.mov(rcx, qword_ptr(rax))?;
            }
            KernelOp::Flush(addr) => {
                a.mov(rax, addr as u64)?;
                a.clflushopt(byte_ptr(rax))?;
            }
            KernelOp::Fence(fence) => fence_instr(&mut a, fence)?,
        }
    }
    a.add(rsi, rows as i32)?;
    a.mov(rax, access_loop.activations as u64)?;
    a.cmp(rsi, rax)?;
    a.jb(loop_start)?;

    timestamp(&mut a)?;
    a.mov(rax, rdx)?;
    a.sub(rax, r10)?;
    a.ret()?;

    let bytes = a.assemble(0)?;
    debug!(
        "assembled {} ops ({} rows per iteration) into {} bytes",
        ops.len(),
        rows,
        bytes.len()
    );
    Ok(bytes)
}

/// Serialized 64-bit timestamp in `rdx`.
fn timestamp(a: &mut CodeAssembler) -> Result<(), IcedError> {
    a.mfence()?;
    a.rdtscp()?;
    a.lfence()?;
    a.shl(rdx, 32u32)?;
    a.or(rdx, rax)?;
    Ok(())
}

/// Spins on the sync row until one access takes between the threshold and
/// three times the threshold.
fn ref_sync(a: &mut CodeAssembler, sync: RefreshSync) -> Result<(), IcedError> {
    trace!("sync on 0x{:x}, threshold {}", sync.addr, sync.threshold);
    let mut start = a.create_label();
    a.set_label(&mut start)?;
    a.mov(rax, sync.addr as u64)?;
    a.clflushopt(byte_ptr(rax))?;
    a.mfence()?;
    a.lfence()?;
    a.rdtscp()?;
    a.lfence()?;
    a.mov(r11d, eax)?;
    a.mov(rax, sync.addr as u64)?;
    a.mov(rdx, qword_ptr(rax))?;
    a.mfence()?;
    a.rdtscp()?;
    a.lfence()?;
    a.sub(eax, r11d)?;
    a.cmp(eax, sync.threshold as u32)?;
    a.jb(start)?;
    a.cmp(eax, sync.upper_bound() as u32)?;
    a.ja(start)?;
    Ok(())
}

fn fence_instr(a: &mut CodeAssembler, fence: FenceType) -> Result<(), IcedError> {
    match fence {
        FenceType::NoFence => Ok(()),
        FenceType::Mfence => a.mfence(),
        FenceType::Lfence => a.lfence(),
        FenceType::Sfence => a.sfence(),
    }
}
