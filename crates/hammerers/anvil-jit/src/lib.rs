//! JIT-compiled hammering kernel.
//!
//! [`JitKernel`] implements [`anvil_core::hammerer::HammerKernel`] by
//! assembling the lowered access loop with `iced-x86` into a function that
//! is mapped executable with `memmap2`. The function runs the loop until the
//! requested number of activations is reached and returns the elapsed
//! timestamp counter cycles.
//!
//! # Features
//!
//! - `jitter_dump` - Write the emitted machine code to [`JIT_DUMP_FILE`]

#![warn(missing_docs)]

mod hammerer;
mod jitter;

pub use hammerer::*;
pub use jitter::Program;
