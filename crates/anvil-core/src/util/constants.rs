/// Page shift value (12 bits) for 4KB pages
pub const PAGE_SHIFT: usize = 12;
/// Standard page size (4096 bytes)
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Mask for extracting page offset
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Row shift value (13 bits) for 8KB rows
pub const ROW_SHIFT: usize = 13;
/// Standard DRAM row size (8192 bytes)
pub const ROW_SIZE: usize = 1 << ROW_SHIFT;

/// Cache line size (64 bytes) for x86_64
pub const CL_SIZE: usize = 64;

/// Number of timed accesses per refresh calibration round
pub const REFRESH_SAMPLES: usize = 1_000_000;

/// Base address for hugepage memory allocations
pub const BASE_MSB: usize = 0x2000000000;

/// Low address bits covered by the DRAM addressing matrices (1 GiB)
pub const MTX_ADDR_MASK: usize = (1 << 30) - 1;
