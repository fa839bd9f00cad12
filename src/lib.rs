//! # anvil
//!
//! A DRAM fault-injection fuzzer. Frequency-domain hammering patterns are
//! generated, mapped onto the rows of one bank, synchronized with DRAM
//! refresh and hammered by a kernel while the victim rows are checked for
//! bit flips.
//!
//! This crate re-exports [`anvil_core`] and, behind features, the kernels
//! and allocators of the workspace:
//!
//! - `jit` - [`anvil_jit`], the JIT-compiled kernel
//! - `interp` - [`anvil_interp`], the interpreted kernel
//! - `hugepage` - [`anvil_hugepage`], the 1 GiB hugepage allocator

pub use anvil_core::*;

#[cfg(feature = "hugepage")]
pub use anvil_hugepage;
#[cfg(feature = "interp")]
pub use anvil_interp;
#[cfg(feature = "jit")]
pub use anvil_jit;
