/// Per-job directory layout
///
/// ```text
/// <data_root>/jobs/<job_id>/
///   input/<document>
///   rules/manifest.json
///   rules/package/...
///   rules/.deps/...
///   rules/.sandbox/sitecustomize.py
///   rules/dependencies.json
///   output/<normalized file>
///   logs/artifact.json  logs/events.ndjson  logs/run.log  logs/install.log
/// ```
use crate::config::types::{Result, RuleboxError};
use crate::sandbox::build::{BuildRef, MANIFEST_FILE};
use log::debug;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Paths inside one job directory. Relative forms are what the sandboxed
/// child sees, since its working directory is the job root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDirectory {
    root: PathBuf,
}

pub const INPUT_DIR: &str = "input";
pub const RULES_DIR: &str = "rules";
pub const OUTPUT_DIR: &str = "output";
pub const LOGS_DIR: &str = "logs";

impl JobDirectory {
    /// Create a fresh directory tree; fails if the job directory already exists.
    pub fn create(jobs_dir: &Path, job_id: &str) -> Result<Self> {
        fs::create_dir_all(jobs_dir)?;
        let root = jobs_dir.join(job_id);
        fs::create_dir(&root).map_err(|e| {
            RuleboxError::Io(std::io::Error::new(
                e.kind(),
                format!("cannot create job directory {}: {}", root.display(), e),
            ))
        })?;
        for sub in [INPUT_DIR, RULES_DIR, OUTPUT_DIR, LOGS_DIR] {
            fs::create_dir(root.join(sub))?;
        }
        debug!("created job directory {}", root.display());
        Ok(Self { root })
    }

    pub fn open(jobs_dir: &Path, job_id: &str) -> Self {
        Self {
            root: jobs_dir.join(job_id),
        }
    }

    /// Layout rooted at an existing directory (the runner's working directory)
    pub fn at(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    pub fn input_path(&self, document_name: &str) -> PathBuf {
        self.root.join(INPUT_DIR).join(document_name)
    }

    pub fn rules_dir(&self) -> PathBuf {
        self.root.join(RULES_DIR)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.rules_dir().join(MANIFEST_FILE)
    }

    pub fn package_dir(&self) -> PathBuf {
        self.rules_dir().join("package")
    }

    pub fn deps_dir(&self) -> PathBuf {
        self.rules_dir().join(".deps")
    }

    pub fn sandbox_dir(&self) -> PathBuf {
        self.rules_dir().join(".sandbox")
    }

    pub fn dependencies_path(&self) -> PathBuf {
        self.rules_dir().join("dependencies.json")
    }

    pub fn output_path(&self, output_name: &str) -> PathBuf {
        self.root.join(OUTPUT_DIR).join(output_name)
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.root.join(LOGS_DIR).join("artifact.json")
    }

    pub fn events_path(&self) -> PathBuf {
        self.root.join(LOGS_DIR).join("events.ndjson")
    }

    pub fn run_log_path(&self) -> PathBuf {
        self.root.join(LOGS_DIR).join("run.log")
    }

    pub fn install_log_path(&self) -> PathBuf {
        self.root.join(LOGS_DIR).join("install.log")
    }

    /// Copy the submitted document under `input/`; returns its file name and digest.
    pub fn copy_input(&self, document: &Path) -> Result<(String, String)> {
        let name = document
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty() && n != "." && n != "..")
            .ok_or_else(|| {
                RuleboxError::Config(format!(
                    "document path {} has no file name",
                    document.display()
                ))
            })?;
        let target = self.input_path(&name);
        fs::copy(document, &target)?;
        let digest = sha256_file(&target)?;
        Ok((name, digest))
    }

    /// Copy the build manifest and rule package into `rules/`. Symlinks in the
    /// package are skipped, never followed.
    pub fn materialize_rules(&self, build: &BuildRef) -> Result<()> {
        fs::copy(build.manifest_path(), self.manifest_path()).map_err(|e| {
            RuleboxError::LaunchFailure(format!("cannot copy build manifest: {}", e))
        })?;

        let src = build.package_dir();
        let dst = self.package_dir();
        fs::create_dir_all(&dst)?;
        if !src.is_dir() {
            return Ok(());
        }

        for entry in WalkDir::new(&src).follow_links(false) {
            let entry = entry.map_err(|e| {
                RuleboxError::LaunchFailure(format!("cannot read rule package: {}", e))
            })?;
            let rel = match entry.path().strip_prefix(&src) {
                Ok(rel) if !rel.as_os_str().is_empty() => rel,
                _ => continue,
            };
            let target = dst.join(rel);
            let file_type = entry.file_type();
            if file_type.is_dir() {
                fs::create_dir_all(&target)?;
            } else if file_type.is_file() {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(entry.path(), &target)?;
            } else {
                debug!("skipping non-regular package entry {}", entry.path().display());
            }
        }
        Ok(())
    }

    /// Remove a directory created for a submission that was then rejected
    pub fn discard(self) {
        if let Err(e) = fs::remove_dir_all(&self.root) {
            log::warn!("failed to remove {}: {}", self.root.display(), e);
        }
    }
}

/// Lowercase hex SHA-256 of a file's contents
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
