/// Sandbox launcher: turns a queued job into a running, restricted child
///
/// `prepare` does everything that can fail before untrusted code runs. A
/// failure there is reported synchronously and no child is started. `spawn`
/// starts the runner under the pre-exec chain:
///
/// 1. `setsid`, parent-death signal, umask 077
/// 2. inherited descriptors marked close-on-exec
/// 3. rlimits (CPU, address space, file size, open files, core)
use crate::config::settings::SupervisorConfig;
use crate::config::types::{Result, RuleboxError};
use crate::jobs::layout::{JobDirectory, INPUT_DIR, OUTPUT_DIR};
use crate::jobs::types::Job;
use crate::kernel::rlimits::{detach_and_bind_lifetime, ResourceLimits};
use crate::sandbox::child::ChildHandle;
use crate::sandbox::deps::{DependencyIsolator, InstallRequest, InstalledDependency};
use crate::sandbox::network::{install_gate, network_flag_value};
use crate::utils::atomic::write_json_atomic;
use crate::utils::env_hygiene::{EnvHygiene, EnvPolicy};
use crate::utils::fd_closure::mark_inherited_fds_cloexec;
use log::{debug, info};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

/// Hidden CLI subcommand the runner binary answers to
pub const RUNNER_SUBCOMMAND: &str = "child";

pub struct SandboxLauncher {
    limits: ResourceLimits,
    runner: PathBuf,
    kill_grace: Duration,
    isolator: DependencyIsolator,
}

/// Everything needed to start the child; produced by [`SandboxLauncher::prepare`]
#[derive(Debug)]
pub struct PreparedLaunch {
    pub job_id: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
    pub dependencies: Vec<InstalledDependency>,
    log: File,
    limits: ResourceLimits,
    kill_grace: Duration,
}

fn launch_err(context: &str, err: impl std::fmt::Display) -> RuleboxError {
    RuleboxError::LaunchFailure(format!("{}: {}", context, err))
}

impl SandboxLauncher {
    pub fn from_config(config: &SupervisorConfig) -> Result<Self> {
        let limits = config.resource_limits();
        Ok(Self {
            limits,
            runner: config.runner_path()?,
            kill_grace: config.kill_grace(),
            isolator: DependencyIsolator::new(
                config.package_cache.clone(),
                config.dependency_install_timeout(),
                limits,
                config.kill_grace(),
            ),
        })
    }

    pub fn limits(&self) -> ResourceLimits {
        self.limits
    }

    pub fn prepare(&self, job: &Job, dir: &JobDirectory) -> Result<PreparedLaunch> {
        let manifest = job.build.load_manifest().map_err(|e| match e {
            RuleboxError::Config(msg) => RuleboxError::LaunchFailure(msg),
            other => other,
        })?;
        let interpreter = job.build.resolve_interpreter(&manifest)?;
        dir.materialize_rules(&job.build)?;

        let mut hygiene = EnvHygiene::new(EnvPolicy::default());
        if let Some(bin_dir) = interpreter.parent() {
            hygiene.prepend_path(bin_dir);
        }
        hygiene.with_passthrough(|key| std::env::var(key).ok());

        let dependencies = if manifest.dependencies.is_empty() {
            Vec::new()
        } else {
            let installer_env = hygiene.build()?;
            let installed = self.isolator.install(&InstallRequest {
                interpreter: &interpreter,
                requirements: &manifest.dependencies,
                network_access: job.network_access,
                target: &dir.deps_dir(),
                log_path: &dir.install_log_path(),
                working_dir: dir.root(),
                env: &installer_env,
            })?;
            write_json_atomic(&dir.dependencies_path(), &installed)?;
            info!(
                "job {}: {} dependencies installed",
                job.id,
                installed.len()
            );
            installed
        };

        if !job.network_access {
            hygiene.push_import_path(install_gate(&dir.sandbox_dir())?);
        }
        hygiene.push_import_path(dir.package_dir());
        if !dependencies.is_empty() {
            hygiene.push_import_path(dir.deps_dir());
        }

        let input_rel = format!("{}/{}", INPUT_DIR, job.document_name);
        let output_rel = format!("{}/{}", OUTPUT_DIR, manifest.output_name);
        hygiene
            .set("RULEBOX_JOB_ID", job.id.clone())
            .set("RULEBOX_NETWORK_ACCESS", network_flag_value(job.network_access))
            .set("RULEBOX_INPUT", input_rel.clone())
            .set("RULEBOX_OUTPUT", output_rel.clone());
        let env = hygiene.build()?;

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.run_log_path())
            .map_err(|e| launch_err("cannot open run log", e))?;

        let mut args = vec![
            RUNNER_SUBCOMMAND.to_string(),
            "--job-id".to_string(),
            job.id.clone(),
            "--interpreter".to_string(),
            interpreter.display().to_string(),
            "--input".to_string(),
            input_rel,
            "--output".to_string(),
            output_rel,
            "--".to_string(),
        ];
        args.extend(manifest.entrypoint.iter().cloned());

        Ok(PreparedLaunch {
            job_id: job.id.clone(),
            program: self.runner.clone(),
            args,
            env,
            working_dir: dir.root().to_path_buf(),
            dependencies,
            log,
            limits: self.limits,
            kill_grace: self.kill_grace,
        })
    }

    /// `prepare` then `spawn`
    pub fn launch(&self, job: &Job, dir: &JobDirectory) -> Result<ChildHandle> {
        self.prepare(job, dir)?.spawn()
    }
}

impl PreparedLaunch {
    pub fn spawn(self) -> Result<ChildHandle> {
        let stderr = self
            .log
            .try_clone()
            .map_err(|e| launch_err("cannot duplicate run log", e))?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env_clear()
            .envs(&self.env)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(self.log))
            .stderr(Stdio::from(stderr));

        let limits = self.limits;
        unsafe {
            cmd.pre_exec(move || {
                detach_and_bind_lifetime()?;
                mark_inherited_fds_cloexec()?;
                limits.apply()
            });
        }

        let child = cmd
            .spawn()
            .map_err(|e| launch_err("cannot start sandbox runner", e))?;
        debug!("job {}: sandbox child {} started", self.job_id, child.id());
        Ok(ChildHandle::new(child, self.kill_grace))
    }
}
