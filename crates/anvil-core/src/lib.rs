//! # Anvil Core
//!
//! `anvil-core` is the foundation of the anvil DRAM fault-injection fuzzer.
//! It implements the fuzzing pipeline
//! *pattern generation → address mapping → refresh synchronization →
//! hammering → flip verification* behind two traits that the other crates of
//! the workspace implement:
//!
//! - [`allocator::RegionAllocator`] - Provides the physically contiguous,
//!   self-aligned region the address model requires.
//!
//! - [`hammerer::HammerKernel`] - Turns an exported access sequence into a
//!   runnable hammering loop.
//!
//! ## Main Components
//!
//! - [`suite::HammerSuite`] - The orchestrator. Runs patterns on several banks
//!   concurrently, shifts them across locations, verifies the victim rows and
//!   builds [`suite::FuzzReport`]s.
//!
//! - [`pattern`] module - Frequency-domain and simple pattern generators,
//!   their mapping to DRAM rows and the scheduling of the exported sequence.
//!
//! - [`memory`] module - The DRAM addressing function, the target region,
//!   refresh calibration and bit flip verification.
//!
//! - [`util`] module - [`util::Rng`], constants and progress helpers.
//!
//! ## Platform Support
//!
//! Hammering and verification use x86_64 intrinsics (`clflush`, `mfence`,
//! `rdtscp`) and Linux interfaces (`mmap`, `sched_setaffinity`,
//! `/proc/self/pagemap`). Physical addresses and hugepages require root.

#![warn(missing_docs)]

pub mod allocator;
pub mod hammerer;
pub mod memory;
pub mod pattern;
pub mod suite;
pub mod util;
