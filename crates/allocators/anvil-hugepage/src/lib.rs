//! Hugepage region allocator.
//!
//! The address model decodes the low 30 bits of an address, so the fuzzing
//! target must be one physically contiguous, 1 GiB aligned region. A single
//! 1 GiB hugepage is exactly that. [`HugepageAllocator`] maps one from
//! hugetlbfs at [`anvil_core::util::BASE_MSB`].
//!
//! Implements the [`anvil_core::allocator::RegionAllocator`] trait.
//!
//! # Platform Requirements
//!
//! - x86_64 Linux with 1 GiB hugepage support
//! - At least one free 1 GiB hugepage, e.g. via `hugepagesz=1G hugepages=1`
//! - hugetlbfs mounted at `/dev/hugepages`

#![warn(missing_docs)]

mod hugepage;

pub use hugepage::*;
