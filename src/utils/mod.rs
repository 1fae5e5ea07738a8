//! Utilities
//!
//! Cross-cutting utilities for FD closure, environment hygiene, atomic writes
//! and bounded output reading.

pub mod atomic;
pub mod env_hygiene;
pub mod fd_closure;
pub mod output;
