use std::fmt::{Debug, Formatter};

use crate::util::{PAGE_MASK, PAGE_SHIFT};
use log::warn;
use pagemap2::{PageMapError, VirtualMemoryArea};
use serde::Serialize;
use thiserror::Error;

#[repr(transparent)]
#[derive(Clone, Copy, Default, Serialize, PartialEq, Eq, Hash)]
/// Physical memory address.
pub struct PhysAddr(usize);

impl Debug for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("PhysAddr(0x{:02x})", self.0))
    }
}

impl std::fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        std::fmt::LowerHex::fmt(&self.0, f)
    }
}

impl PhysAddr {
    /// Creates a new physical address.
    pub fn new(addr: usize) -> Self {
        PhysAddr(addr)
    }

    /// Returns the address as a usize.
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl From<PhysAddr> for usize {
    fn from(addr: PhysAddr) -> usize {
        addr.0
    }
}

/// Trait for resolving virtual addresses to physical addresses.
pub trait VirtToPhysResolver {
    /// Errors that can occur during physical address resolution
    type Error;
    /// Translates a virtual address to a physical address.
    ///
    /// # Errors
    ///
    /// Returns an error if address translation fails.
    fn get_phys(&mut self, virt: u64) -> Result<PhysAddr, Self::Error>;
}

/// Errors that can happen during PageMap operations
#[derive(Debug, Error)]
pub enum LinuxPageMapError {
    /// Reading or parsing the pagemap failed
    #[error(transparent)]
    PageMap(#[from] PageMapError),
    /// The page is not mapped, or the pagemap returned more than one entry
    #[error("got {0} pagemap entries for virtual address 0x{1:x}, expected exactly one")]
    UnexpectedEntries(usize, u64),
}

/// Virtual to physical address translator using Linux pagemap.
///
/// Uses `/proc/{pid}/pagemap` to translate virtual to physical addresses.
/// Requires root privileges to see real frame numbers.
pub struct LinuxPageMap {
    pagemap_wrapper: pagemap2::PageMap,
}

impl LinuxPageMap {
    /// Creates a new pagemap for the current process.
    ///
    /// # Errors
    ///
    /// Returns an error if opening `/proc/self/pagemap` fails.
    pub fn new() -> Result<LinuxPageMap, LinuxPageMapError> {
        let res = LinuxPageMap {
            pagemap_wrapper: pagemap2::PageMap::new(std::process::id() as u64)?,
        };
        Ok(res)
    }
}

impl VirtToPhysResolver for LinuxPageMap {
    type Error = LinuxPageMapError;
    fn get_phys(&mut self, virt: u64) -> Result<PhysAddr, Self::Error> {
        let vaddr_start_page = virt & !(PAGE_MASK as u64);
        let vaddr_end_page = vaddr_start_page + PAGE_MASK as u64;

        let memory_region = VirtualMemoryArea::from((vaddr_start_page, vaddr_end_page));
        let entry = self.pagemap_wrapper.pagemap_vma(&memory_region)?;
        if entry.len() != 1 {
            return Err(LinuxPageMapError::UnexpectedEntries(entry.len(), virt));
        }
        let pfn = entry[0].pfn()?;
        if pfn == 0 {
            warn!(
                "Got invalid PFN 0 for virtual address 0x{:x}. Are we root?",
                virt
            );
        }

        let phys_addr = ((pfn << PAGE_SHIFT) | (virt & PAGE_MASK as u64)) as usize;

        Ok(PhysAddr(phys_addr))
    }
}
