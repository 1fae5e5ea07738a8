/// Line protocol spoken by the rule pipeline on its stdout, and the exit
/// codes the runner reports back to the supervisor
use crate::config::types::{FailureKind, ResourceKind};
use crate::observability::artifact::Severity;
use crate::observability::scores::ScoreValue;
use serde::{Deserialize, Serialize};

/// One protocol line. Anything that does not parse as one of these is either
/// plain log text (non-JSON) or a dropped record (JSON with a `type`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineMessage {
    StageStarted {
        stage: String,
    },
    Table {
        sheet_index: u32,
        header_row: u32,
        first_data_row: u32,
        last_data_row: u32,
        column_count: u32,
    },
    Mapping {
        table_index: u32,
        column_index: u32,
        field: Option<String>,
        #[serde(default)]
        score: Option<ScoreValue>,
    },
    Issue {
        row: u32,
        #[serde(default)]
        column: Option<u32>,
        code: String,
        severity: Severity,
    },
    StageFinished {
        stage: String,
        outcome: StageOutcome,
    },
}

/// Explicit stage result; failures carry a short machine code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    Ok,
    Failed { code: String },
}

/// How a stdout line was classified
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Message(PipelineMessage),
    /// JSON object carrying a `type` key that is not a valid message
    Unrecognized,
    /// Anything else; copied to the run log
    Text,
}

pub fn parse_line(line: &[u8]) -> ParsedLine {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let trimmed = &line[start..];
    if !trimmed.starts_with(b"{") {
        return ParsedLine::Text;
    }
    let value: serde_json::Value = match serde_json::from_slice(trimmed) {
        Ok(value) => value,
        Err(_) => return ParsedLine::Text,
    };
    if value.get("type").is_none() {
        return ParsedLine::Text;
    }
    match serde_json::from_value::<PipelineMessage>(value) {
        Ok(message) => ParsedLine::Message(message),
        Err(_) => ParsedLine::Unrecognized,
    }
}

/// Runner process exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ChildExitCode {
    Success = 0,
    PipelineFailed = 10,
    CpuLimit = 11,
    MemoryLimit = 12,
    OutputLimit = 13,
    SetupFailed = 20,
}

impl ChildExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            10 => Some(Self::PipelineFailed),
            11 => Some(Self::CpuLimit),
            12 => Some(Self::MemoryLimit),
            13 => Some(Self::OutputLimit),
            20 => Some(Self::SetupFailed),
            _ => None,
        }
    }

    pub fn for_resource(kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::Cpu => Self::CpuLimit,
            ResourceKind::Memory => Self::MemoryLimit,
            ResourceKind::OutputSize => Self::OutputLimit,
        }
    }

    /// Taxonomy kind for a non-zero code
    pub fn failure_kind(self) -> Option<FailureKind> {
        match self {
            Self::Success => None,
            Self::PipelineFailed => Some(FailureKind::UserCodeException),
            Self::CpuLimit => Some(FailureKind::ResourceLimitExceeded {
                resource: ResourceKind::Cpu,
            }),
            Self::MemoryLimit => Some(FailureKind::ResourceLimitExceeded {
                resource: ResourceKind::Memory,
            }),
            Self::OutputLimit => Some(FailureKind::ResourceLimitExceeded {
                resource: ResourceKind::OutputSize,
            }),
            Self::SetupFailed => Some(FailureKind::LaunchFailure),
        }
    }
}
