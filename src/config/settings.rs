/// Supervisor configuration loading from a JSON file plus `RULEBOX_*` overrides
use crate::config::types::{Result, RuleboxError};
use crate::kernel::rlimits::ResourceLimits;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Process-wide, operator-tunable settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Holds `jobs/` and `registry/`
    pub data_root: PathBuf,
    /// Number of worker loops (N)
    pub max_concurrency: usize,
    /// Pending-job capacity (M), independent of N
    pub queue_capacity: usize,
    pub wall_clock_timeout_secs: u64,
    pub cpu_seconds: u64,
    pub memory_limit_mb: u64,
    pub output_limit_mb: u64,
    pub open_files_limit: u64,
    /// Network flag applied when a submission does not say
    pub default_network_access: bool,
    /// Local package cache for offline dependency installation
    pub package_cache: Option<PathBuf>,
    pub dependency_install_timeout_secs: u64,
    /// Delay between SIGTERM and SIGKILL when a child is forcibly stopped
    pub kill_grace_ms: u64,
    /// Re-enqueue jobs left `Queued` by a previous supervisor
    pub requeue_on_restart: bool,
    /// Binary started inside the sandbox; defaults to the current executable
    pub runner_binary: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            data_root: std::env::temp_dir().join("rulebox"),
            max_concurrency: 2,
            queue_capacity: 16,
            wall_clock_timeout_secs: 300,
            cpu_seconds: 120,
            memory_limit_mb: 1024,
            output_limit_mb: 256,
            open_files_limit: 64,
            default_network_access: false,
            package_cache: None,
            dependency_install_timeout_secs: 300,
            kill_grace_ms: 200,
            requeue_on_restart: true,
            runner_binary: None,
        }
    }
}

impl SupervisorConfig {
    /// Load configuration from a JSON file; missing keys keep their defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RuleboxError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: SupervisorConfig = serde_json::from_str(&content)
            .map_err(|e| RuleboxError::Config(format!("Failed to parse config JSON: {}", e)))?;

        Ok(config)
    }

    /// Apply `RULEBOX_*` environment overrides on top of the loaded values
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
            raw.trim().parse::<T>().map_err(|_| {
                RuleboxError::Config(format!("Invalid value for {}: {:?}", key, raw))
            })
        }

        if let Some(v) = lookup("RULEBOX_DATA_ROOT") {
            self.data_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("RULEBOX_MAX_CONCURRENCY") {
            self.max_concurrency = parse("RULEBOX_MAX_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("RULEBOX_QUEUE_CAPACITY") {
            self.queue_capacity = parse("RULEBOX_QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("RULEBOX_WALL_CLOCK_TIMEOUT_SECS") {
            self.wall_clock_timeout_secs = parse("RULEBOX_WALL_CLOCK_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("RULEBOX_CPU_SECONDS") {
            self.cpu_seconds = parse("RULEBOX_CPU_SECONDS", &v)?;
        }
        if let Some(v) = lookup("RULEBOX_MEMORY_LIMIT_MB") {
            self.memory_limit_mb = parse("RULEBOX_MEMORY_LIMIT_MB", &v)?;
        }
        if let Some(v) = lookup("RULEBOX_OUTPUT_LIMIT_MB") {
            self.output_limit_mb = parse("RULEBOX_OUTPUT_LIMIT_MB", &v)?;
        }
        if let Some(v) = lookup("RULEBOX_OPEN_FILES_LIMIT") {
            self.open_files_limit = parse("RULEBOX_OPEN_FILES_LIMIT", &v)?;
        }
        if let Some(v) = lookup("RULEBOX_DEFAULT_NETWORK_ACCESS") {
            self.default_network_access = parse("RULEBOX_DEFAULT_NETWORK_ACCESS", &v)?;
        }
        if let Some(v) = lookup("RULEBOX_PACKAGE_CACHE") {
            self.package_cache = if v.trim().is_empty() {
                None
            } else {
                Some(PathBuf::from(v))
            };
        }
        Ok(())
    }

    /// Reject configurations the supervisor cannot run with. Fatal at startup.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.max_concurrency == 0 {
            problems.push("max_concurrency must be at least 1".to_string());
        }
        if self.queue_capacity == 0 {
            problems.push("queue_capacity must be at least 1".to_string());
        }
        if self.wall_clock_timeout_secs == 0 {
            problems.push("wall_clock_timeout_secs must be positive".to_string());
        }
        if self.cpu_seconds == 0 {
            problems.push("cpu_seconds must be positive".to_string());
        }
        if self.memory_limit_mb < 16 {
            problems.push("memory_limit_mb must be at least 16".to_string());
        }
        if self.output_limit_mb == 0 {
            problems.push("output_limit_mb must be positive".to_string());
        }
        if self.open_files_limit < 16 {
            problems.push("open_files_limit must be at least 16".to_string());
        }
        if self.dependency_install_timeout_secs == 0 {
            problems.push("dependency_install_timeout_secs must be positive".to_string());
        }
        if let Some(runner) = &self.runner_binary {
            if !runner.is_file() {
                problems.push(format!("runner_binary {} does not exist", runner.display()));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(RuleboxError::Config(problems.join("; ")))
        }
    }

    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits {
            cpu_seconds: self.cpu_seconds,
            memory_bytes: self.memory_limit_mb * 1024 * 1024,
            output_bytes: self.output_limit_mb * 1024 * 1024,
            open_files: self.open_files_limit,
        }
    }

    pub fn wall_clock_timeout(&self) -> Duration {
        Duration::from_secs(self.wall_clock_timeout_secs)
    }

    pub fn dependency_install_timeout(&self) -> Duration {
        Duration::from_secs(self.dependency_install_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.data_root.join("jobs")
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.data_root.join("registry")
    }

    pub fn runner_path(&self) -> Result<PathBuf> {
        match &self.runner_binary {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe().map_err(|e| {
                RuleboxError::Config(format!("Cannot resolve runner binary: {}", e))
            }),
        }
    }
}
