//! rulebox: bounded job orchestration and sandboxed execution for untrusted
//! rule packages
//!
//! # Architecture
//!
//! ## Supervisor ([`jobs`])
//! - [`jobs::manager`]: `JobManager` API (submit, status, artifact, output, resubmit,
//!   concurrency, shutdown) and the restart sweep
//! - [`jobs::queue`]: bounded FIFO of pending jobs
//! - [`jobs::worker`]: worker threads that drive one child each
//! - [`jobs::lifecycle`]: `Queued -> Running -> {Success | Error | TimedOut}`
//! - [`jobs::store`]: job record persistence
//! - [`jobs::layout`]: per-job directory tree
//!
//! ## Sandbox ([`sandbox`])
//! - [`sandbox::launcher`]: curated environment, pinned working directory, pre-exec chain
//! - [`sandbox::child`]: wait with wall-clock timeout, process-group kill
//! - [`sandbox::deps`]: per-job dependency installation, offline from a local cache
//! - [`sandbox::network`]: import-time socket gate
//! - [`sandbox::build`]: rule package build reference and manifest
//!
//! ## Runner ([`runner`])
//! The process started inside the sandbox. Runs the rule pipeline, reads its
//! line protocol and reports through exit codes.
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::rlimits`]: CPU, address space, file size, open files, core
//! - [`kernel::signal`]: shutdown flag, group termination, death classification
//!
//! ## Observability ([`observability`])
//! - [`observability::artifact`]: structured decision artifact with atomic checkpoints
//! - [`observability::events`]: append-only NDJSON event log
//! - [`observability::scores`]: score normalization at the protocol boundary
//!
//! ## Configuration ([`config`])
//! - [`config::settings`]: `SupervisorConfig` (JSON file, `RULEBOX_*` overrides)
//! - [`config::types`]: error enum and failure taxonomy
//!
//! ## Utilities ([`utils`])
//! - [`utils::fd_closure`]: close-on-exec for inherited descriptors
//! - [`utils::env_hygiene`]: environment built from scratch, credential denylist
//! - [`utils::output`]: bounded line reader
//! - [`utils::atomic`]: temp-file-and-rename writes

pub mod cli;
pub mod config;
pub mod jobs;
pub mod kernel;
pub mod observability;
pub mod runner;
pub mod sandbox;
pub mod utils;

pub use config::settings::SupervisorConfig;
pub use config::types::{FailureKind, ResourceKind, Result, RuleboxError};
pub use jobs::{JobManager, JobStatus, SubmitRequest};
