//! Scalar reference implementations: `extern "C"` pure scalar functions.
//!
//! Golden references for the int8 1×1 convolution kernels. Every function
//! is `#[no_mangle] pub extern "C"` and `#[inline(never)]` so a mismatch
//! can be stepped through symbol by symbol.
//!
//! This crate is compiled with `opt-level = 1` (configured in the workspace
//! root Cargo.toml) to keep the loop structure readable in a debugger.

pub mod conv1x1;
