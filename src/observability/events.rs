/// Append-only lifecycle event log (`logs/events.ndjson`)
///
/// Both the supervisor and the sandboxed runner append to the same file. Each
/// event is serialized up front and written with one `write_all` on an
/// `O_APPEND` descriptor, so lines from the two processes never interleave.
use crate::config::types::Result;
use chrono::{DateTime, Utc};
use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Longest `detail` kept on an event; longer text is cut at a char boundary.
pub const MAX_DETAIL_CHARS: usize = 200;

/// Which side of the sandbox wrote the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Supervisor,
    Runner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    JobQueued,
    JobRunning,
    StageStarted,
    StageFinished,
    StageFailed,
    PipelineExited,
    JobSucceeded,
    JobFailed,
    JobTimedOut,
}

impl EventKind {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EventKind::JobSucceeded | EventKind::JobFailed | EventKind::JobTimedOut
        )
    }
}

/// One NDJSON line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub ts: DateTime<Utc>,
    pub job_id: String,
    pub source: EventSource,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Event {
    pub fn new(job_id: &str, source: EventSource, kind: EventKind) -> Self {
        Self {
            ts: Utc::now(),
            job_id: job_id.to_string(),
            source,
            kind,
            stage: None,
            detail: None,
        }
    }

    pub fn with_stage(mut self, stage: &str) -> Self {
        self.stage = Some(stage.to_string());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        self.detail = Some(match detail.char_indices().nth(MAX_DETAIL_CHARS) {
            Some((cut, _)) => detail[..cut].to_string(),
            None => detail,
        });
        self
    }
}

/// Appender for one job's event file
pub struct EventLog {
    file: Mutex<File>,
    path: PathBuf,
}

impl EventLog {
    /// Open (creating if needed) in append mode
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, event: &Event) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut file = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        file.write_all(&line)?;
        debug!(
            "event {:?} for job {} appended to {}",
            event.kind,
            event.job_id,
            self.path.display()
        );
        Ok(())
    }

    /// Append without failing the caller; event loss is logged, never fatal to a job.
    pub fn append_best_effort(&self, event: &Event) {
        if let Err(e) = self.append(event) {
            error!(
                "Failed to append {:?} event for job {}: {}",
                event.kind, event.job_id, e
            );
        }
    }
}

/// Parse an event file; malformed lines are skipped.
pub fn read_events(path: &Path) -> Result<Vec<Event>> {
    let text = std::fs::read_to_string(path)?;
    Ok(text
        .lines()
        .filter_map(|line| serde_json::from_str::<Event>(line).ok())
        .collect())
}
