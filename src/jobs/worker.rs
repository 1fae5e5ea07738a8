/// Worker threads: each takes one queued job at a time and drives its
/// sandboxed child to a terminal state
use crate::config::types::{FailureKind, Result};
use crate::jobs::layout::{sha256_file, JobDirectory};
use crate::jobs::lifecycle::JobStatus;
use crate::jobs::queue::QueueEntry;
use crate::jobs::store::JobStore;
use crate::jobs::types::Job;
use crate::kernel::signal::{classify_termination, TerminationCause};
use crate::observability::artifact::{Artifact, ArtifactError, ArtifactStatus, ArtifactWriter};
use crate::observability::events::{Event, EventKind, EventLog, EventSource};
use crate::observability::scores::FieldVocabulary;
use crate::runner::protocol::ChildExitCode;
use crate::sandbox::child::{ChildExit, ExitState};
use crate::sandbox::launcher::SandboxLauncher;
use crossbeam_channel::{select, Receiver, Sender};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const LOG_UNAVAILABLE: &str = "job log could not be opened";
const WORKER_FAILURE: &str = "supervisor could not record the job";

/// State shared by every worker of one manager
pub struct WorkerContext {
    pub store: Arc<dyn JobStore>,
    pub launcher: SandboxLauncher,
    pub jobs_dir: PathBuf,
    pub wall_timeout: Duration,
    /// Set once the manager stops; entries taken after this stay `Queued`
    pub shutting_down: AtomicBool,
}

pub struct WorkerHandle {
    id: usize,
    retire: Arc<AtomicBool>,
    wake: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn spawn(
        id: usize,
        context: Arc<WorkerContext>,
        jobs: Receiver<QueueEntry>,
    ) -> Result<Self> {
        let retire = Arc::new(AtomicBool::new(false));
        let (wake, wake_rx) = crossbeam_channel::bounded(1);
        let flag = Arc::clone(&retire);

        let thread = thread::Builder::new()
            .name(format!("rulebox-worker-{}", id))
            .spawn(move || worker_loop(id, &context, &jobs, &wake_rx, &flag))?;

        debug!("worker {} started", id);
        Ok(Self {
            id,
            retire,
            wake,
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Ask the worker to exit. An idle worker leaves at once; a busy one
    /// after its current job.
    pub fn retire(&self) {
        self.retire.store(true, Ordering::SeqCst);
        let _ = self.wake.try_send(());
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("worker {} panicked", self.id);
            }
        }
    }
}

fn worker_loop(
    id: usize,
    context: &WorkerContext,
    jobs: &Receiver<QueueEntry>,
    wake: &Receiver<()>,
    retire: &AtomicBool,
) {
    loop {
        if retire.load(Ordering::SeqCst) {
            break;
        }
        select! {
            recv(jobs) -> entry => match entry {
                Ok(entry) => {
                    if context.shutting_down.load(Ordering::SeqCst) {
                        info!("worker {}: leaving job {} queued for the next start", id, entry.job_id);
                        break;
                    }
                    run_job(id, context, &entry);
                }
                Err(_) => break,
            },
            recv(wake) -> _ => continue,
        }
    }
    debug!("worker {} exiting", id);
}

/// Drive one job; errors stay with the job and never end the worker.
pub fn run_job(worker: usize, context: &WorkerContext, entry: &QueueEntry) {
    if let Err(e) = process(worker, context, entry) {
        error!("worker {}: job {} failed to process: {}", worker, entry.job_id, e);
        settle_record(context, &entry.job_id);
    }
}

/// Last resort after a processing error: a taken job must not stay
/// `Queued` or `Running` with nobody driving it.
fn settle_record(context: &WorkerContext, job_id: &str) {
    let mut job = match context.store.get(job_id) {
        Ok(Some(job)) if !job.status.is_terminal() => job,
        _ => return,
    };
    let settled = job
        .finish(
            JobStatus::Error,
            Some(WORKER_FAILURE.to_string()),
            Some(FailureKind::LaunchFailure),
        )
        .and_then(|()| context.store.update(&job));
    if let Err(e) = settled {
        error!("job {} left {} in the store: {}", job_id, job.status, e);
    }
}

/// Terminal result decided by the worker
#[derive(Debug, Clone, PartialEq, Eq)]
struct Outcome {
    status: JobStatus,
    summary: Option<String>,
    failure: Option<FailureKind>,
    exit: Option<String>,
}

impl Outcome {
    fn success() -> Self {
        Self {
            status: JobStatus::Success,
            summary: None,
            failure: None,
            exit: None,
        }
    }

    fn error(summary: impl Into<String>, failure: FailureKind, exit: Option<String>) -> Self {
        Self {
            status: JobStatus::Error,
            summary: Some(summary.into()),
            failure: Some(failure),
            exit,
        }
    }
}

fn process(worker: usize, context: &WorkerContext, entry: &QueueEntry) -> Result<()> {
    let mut job = match context.store.get(&entry.job_id)? {
        Some(job) => job,
        None => {
            warn!("worker {}: job {} has no record", worker, entry.job_id);
            return Ok(());
        }
    };
    if job.status != JobStatus::Queued {
        debug!("worker {}: job {} is already {}", worker, job.id, job.status);
        return Ok(());
    }

    let dir = JobDirectory::open(&context.jobs_dir, &job.id);
    let events = match EventLog::open(&dir.events_path()) {
        Ok(events) => events,
        Err(e) => {
            warn!("worker {}: job {} has no usable event log: {}", worker, job.id, e);
            let outcome = Outcome::error(LOG_UNAVAILABLE, FailureKind::LaunchFailure, None);
            return conclude(context, &mut job, &dir, None, outcome);
        }
    };

    let prepared = match context.launcher.prepare(&job, &dir) {
        Ok(prepared) => prepared,
        Err(e) => {
            warn!("worker {}: job {} could not be launched: {}", worker, job.id, e);
            let outcome = Outcome::error(e.job_summary(), e.launch_failure_kind(), None);
            return conclude(context, &mut job, &dir, Some(&events), outcome);
        }
    };

    let mut running = job.clone();
    if let Err(e) = running
        .mark_running()
        .and_then(|()| context.store.update(&running))
    {
        warn!("worker {}: job {} could not be marked running: {}", worker, job.id, e);
        let outcome = Outcome::error(e.job_summary(), FailureKind::LaunchFailure, None);
        return conclude(context, &mut job, &dir, Some(&events), outcome);
    }
    let mut job = running;
    events.append_best_effort(&Event::new(&job.id, EventSource::Supervisor, EventKind::JobRunning));
    info!("worker {}: job {} running", worker, job.id);

    let mut child = match prepared.spawn() {
        Ok(child) => child,
        Err(e) => {
            let outcome = Outcome::error(e.job_summary(), FailureKind::LaunchFailure, None);
            return conclude(context, &mut job, &dir, Some(&events), outcome);
        }
    };

    let outcome = match child.wait(context.wall_timeout) {
        Ok(exit) => judge(context, &job, &dir, &exit),
        Err(e) => {
            error!("worker {}: lost child of job {}: {}", worker, job.id, e);
            Outcome::error("sandbox child could not be reaped", FailureKind::LaunchFailure, None)
        }
    };
    conclude(context, &mut job, &dir, Some(&events), outcome)
}

/// Map the runner's exit onto the failure taxonomy
fn judge(context: &WorkerContext, job: &Job, dir: &JobDirectory, exit: &ChildExit) -> Outcome {
    if exit.timed_out {
        return Outcome {
            status: JobStatus::TimedOut,
            summary: Some(format!(
                "wall-clock timeout after {}s",
                context.wall_timeout.as_secs()
            )),
            failure: Some(FailureKind::Timeout),
            exit: Some(exit.state.to_string()),
        };
    }

    let detail = Some(exit.state.to_string());
    match exit.state {
        ExitState::Exited(code) => match ChildExitCode::from_code(code) {
            Some(ChildExitCode::Success) => match verify_success(job, dir) {
                Ok(()) => Outcome::success(),
                Err(reason) => Outcome::error(
                    format!("output invalid: {}", reason),
                    FailureKind::OutputInvalid,
                    detail,
                ),
            },
            Some(ChildExitCode::PipelineFailed) => Outcome::error(
                pipeline_failure_summary(job, dir),
                FailureKind::UserCodeException,
                detail,
            ),
            Some(ChildExitCode::SetupFailed) => Outcome::error(
                "sandbox runner setup failed",
                FailureKind::LaunchFailure,
                detail,
            ),
            Some(limit) => match limit.failure_kind() {
                Some(FailureKind::ResourceLimitExceeded { resource }) => Outcome::error(
                    resource.summary(),
                    FailureKind::ResourceLimitExceeded { resource },
                    detail,
                ),
                _ => Outcome::error("sandbox runner failed", FailureKind::LaunchFailure, detail),
            },
            None => Outcome::error(
                format!("sandbox runner exited unexpectedly (exit {})", code),
                FailureKind::LaunchFailure,
                detail,
            ),
        },
        ExitState::Signaled(sig) => {
            let cpu_limit = Some(context.launcher.limits().cpu_seconds);
            match classify_termination(sig, exit.cpu, cpu_limit) {
                TerminationCause::Limit(resource) => Outcome::error(
                    resource.summary(),
                    FailureKind::ResourceLimitExceeded { resource },
                    detail,
                ),
                TerminationCause::Crashed(sig) => Outcome::error(
                    format!("sandbox runner killed by signal {}", sig),
                    FailureKind::UserCodeException,
                    detail,
                ),
            }
        }
    }
}

/// Field vocabulary from the build itself; the copy under `rules/` is writable
/// by the sandbox.
fn build_vocabulary(job: &Job) -> FieldVocabulary {
    job.build
        .load_manifest()
        .map(|m| m.vocabulary())
        .unwrap_or_default()
}

fn pipeline_failure_summary(job: &Job, dir: &JobDirectory) -> String {
    let error = Artifact::load_checked(&dir.artifact_path(), &job.id, &build_vocabulary(job))
        .ok()
        .and_then(|artifact| artifact.error);
    match error {
        Some(ArtifactError {
            stage: Some(stage),
            code: Some(code),
            ..
        }) => format!("rule pipeline failed at stage {} ({})", stage, code),
        Some(ArtifactError {
            exit: Some(exit), ..
        }) => format!("rule pipeline failed ({})", exit),
        _ => "rule pipeline failed".to_string(),
    }
}

/// A child that claims success must leave a complete job directory behind.
fn verify_success(job: &Job, dir: &JobDirectory) -> std::result::Result<(), String> {
    if !dir.output_path(&job.output_name).is_file() {
        return Err(format!("{} was not written", job.output_name));
    }
    let artifact = Artifact::load_checked(&dir.artifact_path(), &job.id, &build_vocabulary(job))
        .map_err(|_| "artifact unreadable")?;
    if artifact.status != ArtifactStatus::Succeeded {
        return Err("artifact not marked succeeded".to_string());
    }
    let digest = sha256_file(&dir.input_path(&job.document_name))
        .map_err(|_| "input document missing")?;
    if digest != job.input_sha256 {
        return Err("input document changed".to_string());
    }
    Ok(())
}

/// Record the terminal state: artifact error entry, terminal event, record.
fn conclude(
    context: &WorkerContext,
    job: &mut Job,
    dir: &JobDirectory,
    events: Option<&EventLog>,
    outcome: Outcome,
) -> Result<()> {
    if let Some(failure) = &outcome.failure {
        let mut writer =
            ArtifactWriter::resume(&dir.artifact_path(), &job.id, build_vocabulary(job));
        writer.mark_failed(ArtifactError {
            failure: failure.clone(),
            stage: None,
            code: None,
            exit: outcome.exit.clone(),
        });
        if let Err(e) = writer.checkpoint() {
            warn!("job {}: partial artifact not written: {}", job.id, e);
        }
    }

    let kind = match outcome.status {
        JobStatus::Success => EventKind::JobSucceeded,
        JobStatus::TimedOut => EventKind::JobTimedOut,
        _ => EventKind::JobFailed,
    };
    let mut event = Event::new(&job.id, EventSource::Supervisor, kind);
    if let Some(summary) = &outcome.summary {
        event = event.with_detail(summary.clone());
    }

    job.finish(outcome.status, outcome.summary, outcome.failure)?;
    if let Some(events) = events {
        events.append_best_effort(&event);
    }
    context.store.update(job)?;
    match &job.error_summary {
        Some(summary) => info!("job {} finished {}: {}", job.id, job.status, summary),
        None => info!("job {} finished {}", job.id, job.status),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::SupervisorConfig;
    use crate::jobs::store::FsJobStore;
    use crate::jobs::types::sample_job;
    use crate::observability::events::read_events;
    use crate::sandbox::build::BuildRef;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    struct Fixture {
        _data: tempfile::TempDir,
        context: WorkerContext,
        build_root: PathBuf,
        upload: PathBuf,
    }

    /// The runner is replaced by a shell script so each test decides how the
    /// sandboxed side behaves.
    fn fixture(runner_script: &str, wall_secs: u64) -> Fixture {
        let data = tempfile::tempdir().unwrap();
        let build_root = data.path().join("build");
        fs::create_dir_all(build_root.join("package")).unwrap();
        fs::write(
            build_root.join("manifest.json"),
            r#"{"entrypoint": ["rules/package/p.sh"], "interpreter": "/bin/sh"}"#,
        )
        .unwrap();

        let runner = data.path().join("runner.sh");
        fs::write(&runner, format!("#!/bin/sh\n{}\n", runner_script)).unwrap();
        fs::set_permissions(&runner, fs::Permissions::from_mode(0o755)).unwrap();

        let upload = data.path().join("members.csv");
        fs::write(&upload, "name\nada\n").unwrap();

        let config = SupervisorConfig {
            data_root: data.path().join("data"),
            runner_binary: Some(runner),
            wall_clock_timeout_secs: wall_secs,
            kill_grace_ms: 50,
            ..Default::default()
        };
        let store = FsJobStore::open(&config.registry_dir()).unwrap();
        let context = WorkerContext {
            store: Arc::new(store),
            launcher: SandboxLauncher::from_config(&config).unwrap(),
            jobs_dir: config.jobs_dir(),
            wall_timeout: config.wall_clock_timeout(),
            shutting_down: AtomicBool::new(false),
        };
        Fixture {
            _data: data,
            context,
            build_root,
            upload,
        }
    }

    fn enqueue(f: &Fixture, id: &str) -> (QueueEntry, JobDirectory) {
        let dir = JobDirectory::create(&f.context.jobs_dir, id).unwrap();
        let (name, digest) = dir.copy_input(&f.upload).unwrap();
        let mut job = sample_job(id, 1);
        job.build = BuildRef::new("b1", &f.build_root);
        job.document_name = name;
        job.input_sha256 = digest;
        f.context.store.insert(&job).unwrap();
        let entry = QueueEntry {
            job_id: id.to_string(),
            sequence: 1,
        };
        (entry, dir)
    }

    fn finished(f: &Fixture, id: &str) -> Job {
        f.context.store.get(id).unwrap().unwrap()
    }

    #[test]
    fn cpu_exit_code_becomes_resource_failure() {
        let f = fixture("exit 11", 10);
        let (entry, dir) = enqueue(&f, "job-cpu");
        run_job(0, &f.context, &entry);

        let job = finished(&f, "job-cpu");
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error_summary.as_deref(), Some("cpu time limit exceeded"));
        assert_eq!(
            job.failure,
            Some(FailureKind::ResourceLimitExceeded {
                resource: crate::config::types::ResourceKind::Cpu
            })
        );

        let artifact = Artifact::load(&dir.artifact_path()).unwrap();
        assert_eq!(artifact.status, ArtifactStatus::Failed);
        let kinds: Vec<_> = read_events(&dir.events_path())
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![EventKind::JobRunning, EventKind::JobFailed]);
    }

    #[test]
    fn sleeping_child_times_out() {
        let f = fixture("sleep 30", 1);
        let (entry, _dir) = enqueue(&f, "job-slow");
        run_job(0, &f.context, &entry);

        let job = finished(&f, "job-slow");
        assert_eq!(job.status, JobStatus::TimedOut);
        assert_eq!(job.error_summary.as_deref(), Some("wall-clock timeout after 1s"));
        assert_eq!(job.failure, Some(FailureKind::Timeout));
    }

    #[test]
    fn timed_out_child_cannot_plant_artifact_content() {
        let f = fixture(
            "printf '{\"schema\":\"rulebox.artifact.v1\",\"job_id\":\"%s\",\"status\":\"in_progress\",\"updated_at\":\"2024-01-01T00:00:00Z\",\"stages\":[{\"name\":\"ada.lovelace@private.example\",\"status\":\"running\",\"started_at\":\"2024-01-01T00:00:00Z\"}]}' \"$RULEBOX_JOB_ID\" > logs/artifact.json\n\
             sleep 30",
            1,
        );
        let (entry, dir) = enqueue(&f, "job-planted");
        run_job(0, &f.context, &entry);

        assert_eq!(finished(&f, "job-planted").status, JobStatus::TimedOut);
        let raw = fs::read_to_string(dir.artifact_path()).unwrap();
        assert!(!raw.contains("ada.lovelace"), "{}", raw);
        let artifact = Artifact::load(&dir.artifact_path()).unwrap();
        assert_eq!(artifact.status, ArtifactStatus::Failed);
        assert!(artifact.stages.is_empty());
        assert_eq!(artifact.error.unwrap().failure, FailureKind::Timeout);
    }

    #[test]
    fn clean_exit_without_output_is_invalid() {
        let f = fixture("exit 0", 10);
        let (entry, _dir) = enqueue(&f, "job-empty");
        run_job(0, &f.context, &entry);

        let job = finished(&f, "job-empty");
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.failure, Some(FailureKind::OutputInvalid));
        assert!(job.error_summary.unwrap().starts_with("output invalid"));
    }

    #[test]
    fn verified_success() {
        let f = fixture(
            "echo 'name' > output/normalized.csv\n\
             printf '{\"schema\":\"rulebox.artifact.v1\",\"job_id\":\"%s\",\"status\":\"succeeded\",\"updated_at\":\"2024-01-01T00:00:00Z\"}' \"$RULEBOX_JOB_ID\" > logs/artifact.json",
            10,
        );
        let (entry, _dir) = enqueue(&f, "job-ok");
        run_job(0, &f.context, &entry);

        let job = finished(&f, "job-ok");
        assert_eq!(job.status, JobStatus::Success, "{:?}", job.error_summary);
        assert!(job.started_at.is_some() && job.finished_at.is_some());
    }

    #[test]
    fn launch_failure_never_reaches_running() {
        let f = fixture("exit 0", 10);
        fs::write(
            f.build_root.join("manifest.json"),
            r#"{"entrypoint": ["x"], "interpreter": "missing/python"}"#,
        )
        .unwrap();
        let (entry, dir) = enqueue(&f, "job-broken");
        run_job(0, &f.context, &entry);

        let job = finished(&f, "job-broken");
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.started_at.is_none());
        assert_eq!(job.failure, Some(FailureKind::LaunchFailure));
        let kinds: Vec<_> = read_events(&dir.events_path())
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![EventKind::JobFailed]);
    }

    #[test]
    fn non_queued_records_are_skipped() {
        let f = fixture("exit 0", 10);
        let (entry, _dir) = enqueue(&f, "job-done");
        let mut job = finished(&f, "job-done");
        job.finish(JobStatus::Error, Some("earlier".to_string()), None)
            .unwrap();
        f.context.store.update(&job).unwrap();

        run_job(0, &f.context, &entry);
        assert_eq!(
            finished(&f, "job-done").error_summary.as_deref(),
            Some("earlier")
        );
    }

    #[test]
    fn unusable_event_log_still_ends_the_job() {
        let f = fixture("exit 0", 10);
        let (entry, dir) = enqueue(&f, "job-nolog");
        fs::create_dir(dir.events_path()).unwrap();
        run_job(0, &f.context, &entry);

        let job = finished(&f, "job-nolog");
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error_summary.as_deref(), Some(LOG_UNAVAILABLE));
        assert_eq!(job.failure, Some(FailureKind::LaunchFailure));
        assert!(job.started_at.is_none());
    }

    /// Store that refuses updates to `Running`, or the first terminal update
    struct FlakyStore {
        inner: Arc<dyn JobStore>,
        refuse_running: bool,
        terminal_refusals: std::sync::atomic::AtomicUsize,
    }

    impl JobStore for FlakyStore {
        fn insert(&self, job: &Job) -> Result<()> {
            self.inner.insert(job)
        }
        fn update(&self, job: &Job) -> Result<()> {
            let refuse = if job.status == JobStatus::Running {
                self.refuse_running
            } else {
                job.status.is_terminal()
                    && self
                        .terminal_refusals
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok()
            };
            if refuse {
                return Err(crate::config::types::RuleboxError::Store(
                    "registry unavailable".to_string(),
                ));
            }
            self.inner.update(job)
        }
        fn get(&self, job_id: &str) -> Result<Option<Job>> {
            self.inner.get(job_id)
        }
        fn list(&self) -> Result<Vec<Job>> {
            self.inner.list()
        }
    }

    fn flaky(f: Fixture, refuse_running: bool, terminal_refusals: usize) -> Fixture {
        let store: Arc<dyn JobStore> = Arc::new(FlakyStore {
            inner: f.context.store.clone(),
            refuse_running,
            terminal_refusals: std::sync::atomic::AtomicUsize::new(terminal_refusals),
        });
        Fixture {
            context: WorkerContext { store, ..f.context },
            ..f
        }
    }

    #[test]
    fn failed_running_update_ends_the_job_before_launch() {
        let f = flaky(fixture("exit 0", 10), true, 0);
        let (entry, dir) = enqueue(&f, "job-norun");
        run_job(0, &f.context, &entry);

        let job = finished(&f, "job-norun");
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.failure, Some(FailureKind::LaunchFailure));
        assert!(job.started_at.is_none());
        let kinds: Vec<_> = read_events(&dir.events_path())
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![EventKind::JobFailed]);
    }

    #[test]
    fn failed_terminal_update_is_retried_from_the_store() {
        let f = flaky(fixture("exit 11", 10), false, 1);
        let (entry, _dir) = enqueue(&f, "job-retry-write");
        run_job(0, &f.context, &entry);

        let job = finished(&f, "job-retry-write");
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error_summary.as_deref(), Some(WORKER_FAILURE));
        assert!(job.started_at.is_some() && job.finished_at.is_some());
    }

    #[test]
    fn retired_idle_worker_exits() {
        let f = fixture("exit 0", 10);
        let queue = crate::jobs::queue::JobQueue::new(1);
        let handle = WorkerHandle::spawn(7, Arc::new(f.context), queue.receiver()).unwrap();
        assert_eq!(handle.id(), 7);
        handle.retire();
        handle.join();
    }
}
