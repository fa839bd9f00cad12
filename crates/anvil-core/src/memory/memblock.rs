use std::ops::Range;
use std::ptr::null_mut;

use super::BytePointer;
use libc::{MAP_ANONYMOUS, MAP_POPULATE, MAP_SHARED};

/// A managed memory region.
///
/// One contiguous, page-backed virtual range used as the fuzzing target.
#[derive(Clone, Debug)]
pub struct Memory {
    /// Block pointer
    pub ptr: *mut u8,
    /// Block length in bytes
    pub len: usize,
}

unsafe impl Send for Memory {}

impl Memory {
    /// Creates a new memory block with the given pointer and length.
    pub fn new(ptr: *mut u8, len: usize) -> Self {
        Memory { ptr, len }
    }

    /// Allocates memory using mmap.
    ///
    /// Creates a populated, zeroed, anonymous mapping of the specified size
    /// with read/write permissions.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if mmap fails.
    pub fn mmap(size: usize) -> std::result::Result<Self, std::io::Error> {
        let p = unsafe {
            libc::mmap(
                null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                MAP_SHARED | MAP_ANONYMOUS | MAP_POPULATE,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        unsafe { libc::memset(p, 0x00, size) };
        Ok(Memory::new(p as *mut u8, size))
    }

    /// Reserves a lazily backed anonymous mapping whose virtual start is
    /// aligned to `align`.
    ///
    /// Pages are neither populated nor written, so they read as zero until
    /// touched. The alignment is virtual only: the backing frames are not
    /// contiguous, which makes this region unsuitable for real hammering but
    /// fine for dry runs that exercise the address model.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if mmap fails.
    pub fn mmap_aligned(size: usize, align: usize) -> std::result::Result<Self, std::io::Error> {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        let reserve = size + align;
        let p = unsafe {
            libc::mmap(
                null_mut(),
                reserve,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        let start = p as usize;
        let aligned = (start + align - 1) & !(align - 1);
        let head = aligned - start;
        let tail = reserve - head - size;
        unsafe {
            if head > 0 {
                libc::munmap(p, head);
            }
            if tail > 0 {
                libc::munmap((aligned + size) as *mut libc::c_void, tail);
            }
        }
        Ok(Memory::new(aligned as *mut u8, size))
    }

    /// Deallocates the memory block.
    ///
    /// Unmaps the memory region using munmap. Consumes self.
    pub fn dealloc(self) {
        unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) };
    }

    /// Virtual address range covered by this block.
    pub fn bounds(&self) -> Range<usize> {
        let start = self.ptr as usize;
        start..start + self.len
    }

    /// Returns true if `addr` lies inside this block.
    pub fn contains(&self, addr: usize) -> bool {
        self.bounds().contains(&addr)
    }
}

impl BytePointer for Memory {
    fn addr(&self, offset: usize) -> *mut u8 {
        assert!(
            offset < self.len,
            "Memory::byte_add failed. Offset {} >= {}",
            offset,
            self.len
        );
        unsafe { self.ptr.byte_add(offset) }
    }
    fn ptr(&self) -> *mut u8 {
        self.ptr
    }
    fn len(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::Memory;
    use crate::memory::BytePointer;
    use crate::util::PAGE_SIZE;

    #[test]
    fn test_mmap_bounds() {
        let mem = Memory::mmap(4 * PAGE_SIZE).expect("mmap");
        let start = mem.ptr() as usize;
        assert!(mem.contains(start));
        assert!(mem.contains(start + 4 * PAGE_SIZE - 1));
        assert!(!mem.contains(start + 4 * PAGE_SIZE));
        assert_eq!(mem.addr(PAGE_SIZE) as usize, start + PAGE_SIZE);
        assert_eq!(unsafe { *mem.addr(123) }, 0);
        mem.dealloc();
    }

    #[test]
    fn test_mmap_aligned() {
        let align = 1 << 21;
        let mem = Memory::mmap_aligned(4 * align, align).expect("mmap");
        assert_eq!(mem.ptr() as usize % align, 0);
        assert_eq!(mem.len(), 4 * align);
        assert_eq!(unsafe { *mem.addr(3 * align + 5) }, 0);
        mem.dealloc();
    }
}
