//! Thin wrappers around Linux process primitives.
//!
//! All `unsafe` code for the pre-exec chain and signal handling lives here.

pub mod rlimits;
pub mod signal;
