//! Memory allocation strategies for the fuzzing target.
//!
//! This module defines the [`RegionAllocator`] trait and the [`alloc_region`] entry point.
//! The address model only decodes the low 30 bits of an address, so the region must be
//! physically contiguous and aligned to its own size.

use crate::memory::Memory;
use crate::util::compact_mem;
use log::{info, warn};
use thiserror::Error;

/// Trait for allocation strategies that provide one contiguous, aligned region.
///
/// # Associated Types
///
/// * `Error` - The error type returned by allocation operations. Must implement [`std::error::Error`].
///
/// # Examples
///
/// See the `anvil-hugepage` crate for an implementation.
pub trait RegionAllocator {
    /// The error type returned by allocation operations.
    type Error: std::error::Error;

    /// Size in bytes of the region this allocator hands out. The region
    /// must also be aligned to this size.
    fn block_size(&self) -> usize;

    /// Allocates the region.
    ///
    /// # Errors
    ///
    /// May return an error if:
    /// * Required kernel interfaces are unavailable
    /// * Insufficient physical memory is available
    fn alloc_region(&mut self) -> Result<Memory, Self::Error>;
}

/// Errors of [`alloc_region`].
#[derive(Debug, Error)]
pub enum RegionError<E: std::error::Error> {
    /// The allocator failed
    #[error(transparent)]
    Alloc(E),
    /// The region does not have the allocator's block size
    #[error("region has {len} bytes, expected {expected}")]
    WrongSize {
        /// Length of the returned region
        len: usize,
        /// Block size of the allocator
        expected: usize,
    },
    /// The region is not aligned to the allocator's block size
    #[error("region at 0x{addr:x} is not aligned to 0x{align:x}")]
    Misaligned {
        /// Start of the returned region
        addr: usize,
        /// Block size of the allocator
        align: usize,
    },
}

/// Allocate the fuzzing target using an allocation strategy.
///
/// Compacts memory first to improve the odds of getting a large page.
/// A region that does not match the allocator's block size in length and
/// alignment is released again.
///
/// # Errors
///
/// Returns the allocator's error if allocation fails, or a size or
/// alignment error if the region cannot be addressed.
pub fn alloc_region<E: std::error::Error>(
    allocator: &mut dyn RegionAllocator<Error = E>,
) -> Result<Memory, RegionError<E>> {
    if let Err(e) = compact_mem() {
        warn!("Memory compaction failed: {:?}", e);
    }
    let block_size = allocator.block_size();
    let memory = allocator.alloc_region().map_err(RegionError::Alloc)?;
    if memory.len != block_size {
        let len = memory.len;
        memory.dealloc();
        return Err(RegionError::WrongSize {
            len,
            expected: block_size,
        });
    }
    let addr = memory.ptr as usize;
    if block_size == 0 || addr % block_size != 0 {
        memory.dealloc();
        return Err(RegionError::Misaligned {
            addr,
            align: block_size,
        });
    }
    info!("Allocated 0x{:x} bytes at {:p}", block_size, memory.ptr);
    Ok(memory)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: usize = 1 << 21;

    /// Maps `len` bytes at `offset` into a block-aligned mapping.
    struct OffsetAllocator {
        len: usize,
        offset: usize,
    }

    impl RegionAllocator for OffsetAllocator {
        type Error = std::io::Error;

        fn block_size(&self) -> usize {
            BLOCK
        }

        fn alloc_region(&mut self) -> Result<Memory, Self::Error> {
            let mem = Memory::mmap_aligned(2 * BLOCK, BLOCK)?;
            let ptr = unsafe { mem.ptr.add(self.offset) };
            Ok(Memory::new(ptr, self.len))
        }
    }

    #[test]
    fn test_alloc_region_accepts_aligned_block() {
        let mut allocator = OffsetAllocator {
            len: BLOCK,
            offset: 0,
        };
        let mem = alloc_region(&mut allocator).expect("aligned block");
        assert_eq!(mem.ptr as usize % BLOCK, 0);
        assert_eq!(mem.len, BLOCK);
        mem.dealloc();
    }

    #[test]
    fn test_alloc_region_rejects_wrong_size() {
        let mut allocator = OffsetAllocator {
            len: BLOCK / 2,
            offset: 0,
        };
        assert!(matches!(
            alloc_region(&mut allocator),
            Err(RegionError::WrongSize { len, expected }) if len == BLOCK / 2 && expected == BLOCK
        ));
    }

    #[test]
    fn test_alloc_region_rejects_misaligned() {
        let mut allocator = OffsetAllocator {
            len: BLOCK,
            offset: 4096,
        };
        assert!(matches!(
            alloc_region(&mut allocator),
            Err(RegionError::Misaligned { align, .. }) if align == BLOCK
        ));
    }
}
