//! Configuration and shared types
//!
//! Operator settings, the library error enum and the failure taxonomy.

pub mod settings;
pub mod types;
