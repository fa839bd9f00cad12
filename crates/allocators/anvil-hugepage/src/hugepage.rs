use anvil_core::allocator::RegionAllocator;
use anvil_core::memory::Memory;
use anvil_core::util::BASE_MSB;
use lazy_static::lazy_static;
use libc::{MAP_FIXED_NOREPLACE, MAP_POPULATE, MAP_SHARED, O_CREAT, O_RDWR};
use log::debug;
use std::ffi::{CString, c_void};
use thiserror::Error;

// https://www.kernel.org/doc/Documentation/vm/hugetlbpage.txt
//
// /proc/meminfo contains a line like
// Hugepagesize:    1048576 kB
const MEMINFO_PATH: &str = "/proc/meminfo";
const TOKEN: &str = "Hugepagesize:";

/// Backing file of the region on hugetlbfs.
pub const HUGEPAGE_FILE: &str = "/dev/hugepages/anvil_huge";

const GIB: usize = 1 << 30;

lazy_static! {
    static ref HUGEPAGE_SIZE: Option<usize> = std::fs::read_to_string(MEMINFO_PATH)
        .ok()
        .and_then(|s| parse_hugepage_size(&s));
}

fn parse_hugepage_size(s: &str) -> Option<usize> {
    let line = s.lines().find(|l| l.starts_with(TOKEN))?;
    let mut parts = line.strip_prefix(TOKEN)?.split_whitespace();
    let size = parts.next()?.parse::<usize>().ok()?;
    match parts.next() {
        None => Some(size),
        Some("kB") => Some(size * 1024),
        Some(_) => None,
    }
}

/// Errors of the hugepage allocator.
#[derive(Debug, Error)]
pub enum HugepageError {
    /// Opening or mapping the hugetlbfs file failed
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The system's default hugepage size is not 1 GiB
    #[error("default hugepage size is {0:?} bytes, need 1 GiB")]
    UnsupportedSize(Option<usize>),
}

/// Allocator that maps one 1 GiB hugepage at [`BASE_MSB`].
///
/// The region is populated and zeroed before it is returned.
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Default, Copy, Clone)]
pub struct HugepageAllocator {}

impl RegionAllocator for HugepageAllocator {
    type Error = HugepageError;

    fn block_size(&self) -> usize {
        GIB
    }

    fn alloc_region(&mut self) -> Result<Memory, Self::Error> {
        if *HUGEPAGE_SIZE != Some(GIB) {
            return Err(HugepageError::UnsupportedSize(*HUGEPAGE_SIZE));
        }
        let path = CString::new(HUGEPAGE_FILE).map_err(std::io::Error::other)?;
        let fd = unsafe { libc::open(path.as_ptr(), O_RDWR | O_CREAT, 0o666) };
        if fd == -1 {
            return Err(std::io::Error::last_os_error().into());
        }
        let p = unsafe {
            libc::mmap(
                BASE_MSB as *mut c_void,
                GIB,
                libc::PROT_READ | libc::PROT_WRITE,
                MAP_SHARED | MAP_POPULATE | MAP_FIXED_NOREPLACE,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if p == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }
        debug!("mapped {} at {:p}", HUGEPAGE_FILE, p);
        unsafe { libc::memset(p, 0x00, GIB) };
        Ok(Memory::new(p as *mut u8, GIB))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hugepage_size() {
        assert_eq!(parse_hugepage_size("Hugepagesize:1024"), Some(1024));
        assert_eq!(parse_hugepage_size("Hugepagesize: 2 kB"), Some(2048));
        assert_eq!(
            parse_hugepage_size("MemTotal: 1 kB\nHugepagesize:    1048576 kB\n"),
            Some(GIB)
        );

        assert_eq!(parse_hugepage_size("Hugepagesize:1kB"), None);
        assert_eq!(parse_hugepage_size("Hugepagesize: 2 MB"), None);
        assert_eq!(parse_hugepage_size("MemTotal: 1 kB"), None);
    }

    #[test]
    #[ignore = "needs a free 1 GiB hugepage"]
    fn test_allocator() {
        let mut allocator = HugepageAllocator::default();
        let mem = allocator.alloc_region().expect("allocation failed");
        assert_eq!(mem.ptr as usize, BASE_MSB);
        assert_eq!(mem.len, GIB);
        unsafe {
            *mem.ptr.add(GIB - 1) = 20;
            assert_eq!(*mem.ptr.add(GIB - 1), 20);
        }
        mem.dealloc();
    }
}
