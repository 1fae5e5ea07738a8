use crate::config::settings::SupervisorConfig;
use crate::config::types::RuleboxError;
use crate::jobs::manager::{recover, JobManager};
use crate::jobs::store::{FsJobStore, JobStore};
use crate::jobs::types::{StatusReport, SubmitRequest};
use crate::jobs::JobStatus;
use crate::kernel::signal::SignalHandler;
use crate::runner::{run_child, ChildArgs};
use crate::sandbox::build::BuildRef;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const SUBMIT_RETRY: Duration = Duration::from_millis(100);
const WAIT_SLICE: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a supervisor, submit documents and wait for every job to finish
    Run {
        /// Supervisor configuration (JSON); defaults plus RULEBOX_* overrides if absent
        #[arg(long)]
        config: Option<PathBuf>,
        /// Build directory holding manifest.json and package/
        #[arg(long)]
        build: PathBuf,
        /// Build identifier; defaults to the build directory name
        #[arg(long)]
        build_id: Option<String>,
        /// Allow the rule pipeline to use the network
        #[arg(long)]
        network: bool,
        /// Documents to normalize, one job each
        #[arg(required = true)]
        documents: Vec<PathBuf>,
    },
    /// Print the status of one job
    Status {
        #[arg(long)]
        config: Option<PathBuf>,
        job_id: String,
    },
    /// Sweep records left behind by a supervisor that stopped uncleanly
    Recover {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Runner role inside the sandbox (internal)
    #[command(hide = true)]
    Child {
        #[arg(long)]
        job_id: String,
        #[arg(long)]
        interpreter: PathBuf,
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(last = true, required = true)]
        entrypoint: Vec<String>,
    },
}

fn load_config(path: Option<&Path>) -> Result<SupervisorConfig> {
    let mut config = match path {
        Some(path) => SupervisorConfig::load_from_file(path)?,
        None => SupervisorConfig::default(),
    };
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

fn build_ref(build_id: Option<String>, root: PathBuf) -> BuildRef {
    let id = build_id.unwrap_or_else(|| {
        root.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "build".to_string())
    });
    BuildRef::new(id, root)
}

/// Entry point for the `rulebox` binary; returns the process exit code.
pub fn run() -> Result<i32> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Child {
            job_id,
            interpreter,
            input,
            output,
            entrypoint,
        } => {
            let args = ChildArgs {
                job_id,
                interpreter,
                input,
                output,
                entrypoint,
            };
            Ok(run_child(&args).code())
        }
        Commands::Run {
            config,
            build,
            build_id,
            network,
            documents,
        } => {
            let signals = SignalHandler::init().map_err(anyhow::Error::msg)?;
            let config = load_config(config.as_deref())?;
            let store: Arc<dyn JobStore> = Arc::new(FsJobStore::open(&config.registry_dir())?);
            let manager = JobManager::start(config, store)?;
            let build = build_ref(build_id, build);
            let network = if network { Some(true) } else { None };

            let mut job_ids = Vec::new();
            for document in documents {
                let request = SubmitRequest {
                    document: document.clone(),
                    build: build.clone(),
                    network_access: network,
                };
                loop {
                    match manager.submit(request.clone()) {
                        Ok(receipt) => {
                            info!("{} -> job {}", document.display(), receipt.job_id);
                            job_ids.push(receipt.job_id);
                            break;
                        }
                        Err(RuleboxError::QueueFull { .. }) if !signals.shutdown_requested() => {
                            std::thread::sleep(SUBMIT_RETRY);
                        }
                        Err(e) => {
                            manager.shutdown();
                            return Err(e)
                                .with_context(|| format!("submitting {}", document.display()));
                        }
                    }
                }
            }

            let mut all_succeeded = true;
            for job_id in &job_ids {
                let report = match wait_interruptibly(&manager, job_id, &signals)? {
                    Some(report) => report,
                    None => {
                        warn!("interrupted; leaving remaining jobs to the next start");
                        manager.shutdown();
                        return Ok(128 + signals.get_signal() as i32);
                    }
                };
                all_succeeded &= report.status == JobStatus::Success;
                println!("{}", serde_json::to_string(&report)?);
            }
            manager.shutdown();
            Ok(if all_succeeded { 0 } else { 1 })
        }
        Commands::Status { config, job_id } => {
            let config = load_config(config.as_deref())?;
            let store = FsJobStore::open(&config.registry_dir())?;
            let job = store
                .get(&job_id)?
                .ok_or_else(|| RuleboxError::UnknownJob(job_id.clone()))?;
            println!("{}", serde_json::to_string_pretty(&job.report())?);
            Ok(0)
        }
        Commands::Recover { config } => {
            let config = load_config(config.as_deref())?;
            let store = FsJobStore::open(&config.registry_dir())?;
            let report = recover(&config, &store, None)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(0)
        }
    }
}

/// `None` when a shutdown signal arrived first
fn wait_interruptibly(
    manager: &JobManager,
    job_id: &str,
    signals: &SignalHandler,
) -> Result<Option<StatusReport>> {
    loop {
        if signals.shutdown_requested() {
            return Ok(None);
        }
        match manager.wait_for_terminal(job_id, WAIT_SLICE) {
            Ok(report) => return Ok(Some(report)),
            Err(RuleboxError::NotReady(_)) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
