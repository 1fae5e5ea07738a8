/// Job records and the reports handed back to callers
use crate::config::types::{FailureKind, Result};
use crate::jobs::lifecycle::{check_transition, JobStatus};
use crate::sandbox::build::BuildRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Persistent job record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    /// Enqueue order within one data root
    pub sequence: u64,
    /// Host path the document was submitted from
    pub document: PathBuf,
    /// File name of the copy under `input/`
    pub document_name: String,
    pub input_sha256: String,
    pub build: BuildRef,
    /// Output file name under `output/`, taken from the build manifest
    pub output_name: String,
    pub network_access: bool,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_summary: Option<String>,
    #[serde(default)]
    pub failure: Option<FailureKind>,
    #[serde(default)]
    pub retry_of: Option<String>,
}

impl Job {
    pub fn mark_running(&mut self) -> Result<()> {
        check_transition(&self.id, self.status, JobStatus::Running)?;
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Write the terminal fields. Fails if the job is already terminal.
    pub fn finish(
        &mut self,
        status: JobStatus,
        summary: Option<String>,
        failure: Option<FailureKind>,
    ) -> Result<()> {
        check_transition(&self.id, self.status, status)?;
        self.status = status;
        self.finished_at = Some(Utc::now());
        self.error_summary = summary;
        self.failure = failure;
        Ok(())
    }

    pub fn report(&self) -> StatusReport {
        StatusReport {
            job_id: self.id.clone(),
            status: self.status,
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            error_summary: self.error_summary.clone(),
        }
    }
}

/// Snapshot returned by `get_status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub job_id: String,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReceipt {
    pub job_id: String,
    pub status: JobStatus,
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub document: PathBuf,
    pub build: BuildRef,
    /// `None` takes the operator default
    pub network_access: Option<bool>,
}

#[cfg(test)]
pub(crate) fn sample_job(id: &str, sequence: u64) -> Job {
    Job {
        id: id.to_string(),
        status: JobStatus::Queued,
        sequence,
        document: PathBuf::from("/uploads/members.csv"),
        document_name: "members.csv".to_string(),
        input_sha256: "00".repeat(32),
        build: BuildRef::new("b1", "/builds/b1"),
        output_name: "normalized.csv".to_string(),
        network_access: false,
        submitted_at: Utc::now(),
        started_at: None,
        finished_at: None,
        error_summary: None,
        failure: None,
        retry_of: None,
    }
}
