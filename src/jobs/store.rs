/// Job record persistence
use crate::config::types::{Result, RuleboxError};
use crate::jobs::types::Job;
use crate::utils::atomic::write_json_atomic;
use log::warn;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Metadata store seam. The supervisor only needs keyed records and a scan.
pub trait JobStore: Send + Sync {
    /// Fails if a record with the same id exists
    fn insert(&self, job: &Job) -> Result<()>;
    /// Fails if the record does not exist
    fn update(&self, job: &Job) -> Result<()>;
    fn get(&self, job_id: &str) -> Result<Option<Job>>;
    fn list(&self) -> Result<Vec<Job>>;
}

/// One JSON file per job under `<data_root>/registry/`
pub struct FsJobStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

fn valid_id(job_id: &str) -> bool {
    !job_id.is_empty()
        && job_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

impl FsJobStore {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            RuleboxError::Store(format!("cannot create registry {}: {}", dir.display(), e))
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    fn record_path(&self, job_id: &str) -> Result<PathBuf> {
        if !valid_id(job_id) {
            return Err(RuleboxError::UnknownJob(job_id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", job_id)))
    }

    fn read_record(path: &Path) -> Result<Job> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            RuleboxError::Store(format!("corrupt record {}: {}", path.display(), e))
        })
    }
}

impl JobStore for FsJobStore {
    fn insert(&self, job: &Job) -> Result<()> {
        let path = self.record_path(&job.id)?;
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        if path.exists() {
            return Err(RuleboxError::Store(format!("job {} already exists", job.id)));
        }
        write_json_atomic(&path, job)
    }

    fn update(&self, job: &Job) -> Result<()> {
        let path = self.record_path(&job.id)?;
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        if !path.exists() {
            return Err(RuleboxError::UnknownJob(job.id.clone()));
        }
        write_json_atomic(&path, job)
    }

    fn get(&self, job_id: &str) -> Result<Option<Job>> {
        let path = match self.record_path(job_id) {
            Ok(path) => path,
            Err(_) => return Ok(None),
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::read_record(&path).map(Some)
    }

    fn list(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for entry in fs::read_dir(&self.dir)?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_record(&path) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("skipping unreadable job record: {}", e),
            }
        }
        jobs.sort_by_key(|j| j.sequence);
        Ok(jobs)
    }
}
