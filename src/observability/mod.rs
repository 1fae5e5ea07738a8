//! Observability
//!
//! Per-job artifact and event log. Both live in the job's `logs/` directory
//! and never carry document content.

pub mod artifact;
pub mod events;
pub mod scores;
