/// Core error and failure types shared by the supervisor and the sandboxed runner
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised by rulebox operations
#[derive(Error, Debug)]
pub enum RuleboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Submission rejected; nothing was created for it.
    #[error("Queue is full (capacity {capacity}); retry later")]
    QueueFull { capacity: usize },

    #[error("Job manager is shutting down")]
    ShuttingDown,

    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Illegal transition for job {job_id}: {from} -> {to}")]
    IllegalTransition {
        job_id: String,
        from: String,
        to: String,
    },

    #[error("Launch failure: {0}")]
    LaunchFailure(String),

    #[error("Dependency install failure: {0}")]
    DependencyInstall(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Job store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, RuleboxError>;

impl From<nix::errno::Errno> for RuleboxError {
    fn from(err: nix::errno::Errno) -> Self {
        RuleboxError::Process(err.to_string())
    }
}

/// Which ceiling a child ran into
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Cpu,
    Memory,
    OutputSize,
}

impl ResourceKind {
    pub fn summary(self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu time limit exceeded",
            ResourceKind::Memory => "memory limit exceeded",
            ResourceKind::OutputSize => "output size limit exceeded",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Cpu => write!(f, "cpu"),
            ResourceKind::Memory => write!(f, "memory"),
            ResourceKind::OutputSize => write!(f, "output_size"),
        }
    }
}

/// Why a job ended in `Error` or `TimedOut`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// Sandbox could not be prepared; no child ever started.
    LaunchFailure,
    DependencyInstallFailure,
    ResourceLimitExceeded { resource: ResourceKind },
    Timeout,
    /// The rule pipeline failed inside the child.
    UserCodeException,
    /// Child reported success but the job directory does not hold a valid result.
    OutputInvalid,
    SupervisorRestarted,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::LaunchFailure => write!(f, "launch_failure"),
            FailureKind::DependencyInstallFailure => write!(f, "dependency_install_failure"),
            FailureKind::ResourceLimitExceeded { resource } => {
                write!(f, "resource_limit_exceeded:{}", resource)
            }
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::UserCodeException => write!(f, "user_code_exception"),
            FailureKind::OutputInvalid => write!(f, "output_invalid"),
            FailureKind::SupervisorRestarted => write!(f, "supervisor_restarted"),
        }
    }
}

impl RuleboxError {
    /// Failure kind recorded on a job when this error stops it before its child runs.
    pub fn launch_failure_kind(&self) -> FailureKind {
        match self {
            RuleboxError::DependencyInstall(_) => FailureKind::DependencyInstallFailure,
            _ => FailureKind::LaunchFailure,
        }
    }

    /// Short, user-facing summary; never includes OS error chains for dependency failures.
    pub fn job_summary(&self) -> String {
        match self {
            RuleboxError::DependencyInstall(reason) => reason.clone(),
            RuleboxError::LaunchFailure(reason) => format!("sandbox launch failed: {}", reason),
            other => format!("sandbox launch failed: {}", other),
        }
    }
}
