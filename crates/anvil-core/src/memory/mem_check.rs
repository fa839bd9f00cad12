use crate::memory::{BitFlip, BytePointer, DRAMAddr, DataPattern, MemConfiguration, Memory, Reference};
use crate::util::{CL_SIZE, PAGE_MASK, PAGE_SIZE};
use libc::{c_void, memcmp};
use log::{debug, info, warn};
use std::arch::x86_64::{_mm_clflush, _mm_mfence};
use std::collections::BTreeSet;

/// Bit flip detector for the fuzzing target.
///
/// Writes the reference fill and scans for deviations from it. All scanning
/// methods take `&mut self`; the checker is only ever used from the
/// orchestrating thread, after all hammering threads have joined.
#[derive(Debug)]
pub struct MemCheck<'a> {
    memory: &'a Memory,
    reference: Reference,
    initialized: bool,
}

impl<'a> MemCheck<'a> {
    /// Creates a checker for `memory` using `pattern` as the reference fill.
    pub fn new(memory: &'a Memory, pattern: DataPattern) -> Self {
        MemCheck {
            memory,
            reference: Reference::new(pattern),
            initialized: false,
        }
    }

    /// Creates a checker for a region that already holds the reference fill,
    /// e.g. written by an earlier checker with the same pattern.
    pub fn resume(memory: &'a Memory, pattern: DataPattern) -> Self {
        MemCheck {
            initialized: true,
            ..Self::new(memory, pattern)
        }
    }

    /// The reference fill.
    pub fn pattern(&self) -> DataPattern {
        self.reference.pattern()
    }

    /// Writes the reference fill to the whole region.
    pub fn initialize(&mut self) {
        let len = self.memory.len();
        assert!(
            len.is_multiple_of(PAGE_SIZE),
            "memory len ({}) must be divisible by PAGE_SIZE ({})",
            len,
            PAGE_SIZE
        );
        info!(
            "initialize {} bytes with pattern {}",
            len,
            self.reference.pattern()
        );
        for offset in (0..len).step_by(PAGE_SIZE) {
            let value = *self.reference.page(offset / PAGE_SIZE);
            unsafe {
                std::ptr::write_volatile(self.memory.addr(offset) as *mut [u8; PAGE_SIZE], value);
            }
        }
        self.initialized = true;
        debug!("memory init done");
    }

    /// Scans the whole region.
    pub fn check(&mut self) -> Vec<BitFlip> {
        let pages = (0..self.memory.len()).step_by(PAGE_SIZE).collect::<Vec<_>>();
        self.check_pages(pages)
    }

    /// Scans the pages holding the given rows of `bank`.
    ///
    /// Rows outside the region are ignored.
    pub fn check_rows(
        &mut self,
        bank: usize,
        rows: &[usize],
        mem_config: &MemConfiguration,
    ) -> Vec<BitFlip> {
        let base = self.memory.ptr() as *const u8;
        let mut pages = BTreeSet::new();
        for &row in rows {
            for col in (0..mem_config.get_col_count()).step_by(CL_SIZE) {
                let virt = DRAMAddr::new(bank, row, col).to_virt(base, mem_config) as usize;
                if self.memory.contains(virt) {
                    pages.insert((virt - base as usize) & !PAGE_MASK);
                }
            }
        }
        debug!(
            "checking {} rows of bank {} ({} pages)",
            rows.len(),
            bank,
            pages.len()
        );
        self.check_pages(pages)
    }

    fn check_pages(&mut self, pages: impl IntoIterator<Item = usize>) -> Vec<BitFlip> {
        if !self.initialized {
            warn!("memory check on uninitialized region, reporting no flips");
            return vec![];
        }
        let mut ret = vec![];
        for offset in pages {
            let expected = self.reference.page(offset / PAGE_SIZE);
            unsafe {
                for byte_offset in (0..PAGE_SIZE).step_by(CL_SIZE) {
                    _mm_clflush(self.memory.addr(offset + byte_offset));
                }
                _mm_mfence();
                let cmp = memcmp(
                    self.memory.addr(offset) as *const c_void,
                    expected.as_ptr() as *const c_void,
                    PAGE_SIZE,
                );
                if cmp == 0 {
                    continue;
                }
                debug!(
                    "Found bitflip in page {}. Determining exact flip position",
                    offset
                );
                for (i, &expected) in expected.iter().enumerate() {
                    let addr = self.memory.addr(offset + i);
                    let actual = std::ptr::read_volatile(addr);
                    if actual != expected {
                        ret.push(BitFlip::new(addr, actual ^ expected, expected));
                    }
                }
            }
        }
        ret
    }

    /// Rewrites the expected bytes at each flip location.
    pub fn restore(&mut self, flips: &[BitFlip]) {
        let base = self.memory.ptr() as usize;
        for flip in flips {
            if !self.memory.contains(flip.addr) {
                warn!("not restoring flip outside region: {:?}", flip);
                continue;
            }
            let expected = self.reference.byte(flip.addr - base);
            unsafe {
                std::ptr::write_volatile(flip.addr as *mut u8, expected);
                _mm_clflush(flip.addr as *const u8);
            }
        }
        unsafe { _mm_mfence() };
    }
}

#[cfg(test)]
mod tests {
    use super::MemCheck;
    use crate::memory::{BitFlip, BytePointer, DataPattern, Memory};
    use crate::util::PAGE_SIZE;

    #[test]
    fn test_uninitialized_reports_nothing() {
        let mem = Memory::mmap(2 * PAGE_SIZE).expect("mmap");
        let mut check = MemCheck::new(&mem, DataPattern::One);
        assert!(check.check().is_empty());
        drop(check);
        mem.dealloc();
    }

    #[test]
    fn test_detect_and_restore() {
        let mem = Memory::mmap(16 * PAGE_SIZE).expect("mmap");
        let mut check = MemCheck::new(&mem, DataPattern::Random { seed: 0xdead });
        check.initialize();
        assert!(check.check().is_empty());

        let addr = mem.addr(5 * PAGE_SIZE + 77);
        let expected = unsafe { *addr };
        unsafe { *addr = expected ^ 0b0001_0100 };

        let flips = check.check();
        assert_eq!(
            flips,
            vec![BitFlip::new(addr, 0b0001_0100, expected)]
        );
        check.restore(&flips);
        assert!(check.check().is_empty());
        drop(check);
        mem.dealloc();
    }

    #[test]
    fn test_stable_across_checkers() {
        let mem = Memory::mmap(8 * PAGE_SIZE).expect("mmap");
        let pattern = DataPattern::Random { seed: 42 };
        MemCheck::new(&mem, pattern).initialize();
        let mut resumed = MemCheck::resume(&mem, pattern);
        assert!(resumed.check().is_empty());
        let mut other_seed = MemCheck::resume(&mem, DataPattern::Random { seed: 43 });
        assert!(!other_seed.check().is_empty());
        drop(resumed);
        drop(other_seed);
        mem.dealloc();
    }
}
