/// Per-job dependency isolation
///
/// Declared packages are installed into the job's private `rules/.deps`
/// directory by the build's own interpreter. Jobs without network access may
/// only install from the operator's local package cache.
use crate::config::types::{Result, RuleboxError};
use crate::kernel::rlimits::{detach_and_bind_lifetime, ResourceLimits};
use crate::sandbox::child::{ChildHandle, ExitState};
use crate::utils::fd_closure::mark_inherited_fds_cloexec;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

pub const OFFLINE_UNAVAILABLE: &str = "dependencies unavailable offline";

/// One installed distribution, as found in the target directory
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstalledDependency {
    pub name: String,
    pub version: String,
}

/// Inputs for one installation
pub struct InstallRequest<'a> {
    pub interpreter: &'a Path,
    pub requirements: &'a [String],
    pub network_access: bool,
    pub target: &'a Path,
    pub log_path: &'a Path,
    pub working_dir: &'a Path,
    /// Curated environment shared with the sandbox launch
    pub env: &'a BTreeMap<String, String>,
}

/// Runs the package installer under the same limits as the job itself
#[derive(Debug, Clone)]
pub struct DependencyIsolator {
    package_cache: Option<PathBuf>,
    timeout: Duration,
    limits: ResourceLimits,
    kill_grace: Duration,
}

/// Reject requirement strings that could smuggle installer options or remote URLs
pub fn validate_requirement(requirement: &str) -> Result<()> {
    let trimmed = requirement.trim();
    let bad = trimmed.is_empty()
        || trimmed.starts_with('-')
        || trimmed.chars().any(char::is_whitespace)
        || trimmed.contains('/')
        || trimmed.contains("://");
    if bad {
        return Err(RuleboxError::DependencyInstall(format!(
            "invalid dependency requirement {:?}",
            requirement
        )));
    }
    Ok(())
}

/// Read `<name>-<version>.dist-info` directories from an install target, sorted.
pub fn scan_installed(target: &Path) -> Result<Vec<InstalledDependency>> {
    let mut installed = Vec::new();
    if !target.exists() {
        return Ok(installed);
    }
    for entry in fs::read_dir(target)?.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(".dist-info") {
            if let Some((dist, version)) = stem.rsplit_once('-') {
                installed.push(InstalledDependency {
                    name: dist.to_string(),
                    version: version.to_string(),
                });
            }
        }
    }
    installed.sort();
    Ok(installed)
}

impl DependencyIsolator {
    pub fn new(
        package_cache: Option<PathBuf>,
        timeout: Duration,
        limits: ResourceLimits,
        kill_grace: Duration,
    ) -> Self {
        Self {
            package_cache,
            timeout,
            limits,
            kill_grace,
        }
    }

    /// Installer arguments after the interpreter
    pub fn installer_args(&self, request: &InstallRequest<'_>) -> Result<Vec<String>> {
        for requirement in request.requirements {
            validate_requirement(requirement)?;
        }

        let mut args: Vec<String> = [
            "-m",
            "pip",
            "install",
            "--no-input",
            "--disable-pip-version-check",
            "--no-compile",
            "--target",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push(request.target.display().to_string());

        let cache = self.package_cache.as_ref().filter(|p| p.is_dir());
        if request.network_access {
            if let Some(cache) = cache {
                args.push("--find-links".to_string());
                args.push(cache.display().to_string());
            }
        } else {
            let cache = cache
                .ok_or_else(|| RuleboxError::DependencyInstall(OFFLINE_UNAVAILABLE.to_string()))?;
            args.push("--no-index".to_string());
            args.push("--find-links".to_string());
            args.push(cache.display().to_string());
        }

        args.push("--".to_string());
        args.extend(request.requirements.iter().map(|r| r.trim().to_string()));
        Ok(args)
    }

    /// Install `request.requirements`; nothing runs when the request is empty.
    pub fn install(&self, request: &InstallRequest<'_>) -> Result<Vec<InstalledDependency>> {
        if request.requirements.is_empty() {
            return Ok(Vec::new());
        }
        let args = self.installer_args(request)?;

        fs::create_dir_all(request.target)?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(request.log_path)
            .map_err(|e| {
                RuleboxError::DependencyInstall(format!("cannot open install log: {}", e))
            })?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(request.interpreter);
        cmd.args(&args)
            .env_clear()
            .envs(request.env)
            .env("PIP_CONFIG_FILE", "/dev/null")
            .env("PIP_NO_CACHE_DIR", "1")
            .current_dir(request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        let limits = self.limits;
        unsafe {
            cmd.pre_exec(move || {
                detach_and_bind_lifetime()?;
                mark_inherited_fds_cloexec()?;
                limits.apply()
            });
        }

        info!(
            "installing {} dependencies into {} (network {})",
            request.requirements.len(),
            request.target.display(),
            if request.network_access { "on" } else { "off" }
        );

        let child = cmd.spawn().map_err(|e| {
            RuleboxError::DependencyInstall(format!("cannot start package installer: {}", e))
        })?;
        let mut handle = ChildHandle::new(child, self.kill_grace);
        let exit = handle.wait(self.timeout)?;

        if exit.timed_out {
            return Err(RuleboxError::DependencyInstall(
                "dependency installation timed out".to_string(),
            ));
        }
        match exit.state {
            ExitState::Exited(0) => {}
            state => {
                warn!("package installer failed: {}", state);
                let reason = if request.network_access {
                    format!("dependency installation failed ({})", state)
                } else {
                    OFFLINE_UNAVAILABLE.to_string()
                };
                return Err(RuleboxError::DependencyInstall(reason));
            }
        }

        scan_installed(request.target)
    }
}
