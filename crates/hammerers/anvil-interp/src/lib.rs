//! Interpreted hammering kernel.
//!
//! [`InterpKernel`] implements [`anvil_core::hammerer::HammerKernel`] without
//! generating code: it executes the lowered access loop with volatile loads
//! and cache intrinsics. It runs wherever the JIT cannot, e.g. without
//! `clflushopt` or in dry runs on ordinary memory.

#![warn(missing_docs)]

mod interp;

pub use interp::*;
