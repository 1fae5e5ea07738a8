/// Job manager: the supervisor's public surface
///
/// Owns the queue, the record store, the launcher and the worker registry.
/// Constructed once per data root and shared through `Arc`.
use crate::config::settings::SupervisorConfig;
use crate::config::types::{FailureKind, Result, RuleboxError};
use crate::jobs::layout::JobDirectory;
use crate::jobs::lifecycle::JobStatus;
use crate::jobs::queue::{JobQueue, QueueEntry};
use crate::jobs::store::JobStore;
use crate::jobs::types::{Job, JobReceipt, StatusReport, SubmitRequest};
use crate::jobs::worker::{WorkerContext, WorkerHandle};
use crate::observability::artifact::{ArtifactError, ArtifactWriter};
use crate::observability::events::{Event, EventKind, EventLog, EventSource};
use crate::sandbox::launcher::SandboxLauncher;
use chrono::Utc;
use log::{info, warn};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

const RESTART_SUMMARY: &str = "supervisor restarted";
const REQUEUE_FULL_SUMMARY: &str = "queue full after restart";
const STATUS_POLL: Duration = Duration::from_millis(50);

/// What the restart sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub requeued: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Default)]
struct WorkerRegistry {
    active: Vec<WorkerHandle>,
    retiring: Vec<WorkerHandle>,
}

pub struct JobManager {
    config: SupervisorConfig,
    store: Arc<dyn JobStore>,
    queue: JobQueue,
    context: Arc<WorkerContext>,
    workers: Mutex<WorkerRegistry>,
    submit_lock: Mutex<()>,
    next_sequence: AtomicU64,
    next_worker_id: AtomicUsize,
}

impl JobManager {
    /// Validate the configuration, sweep records left by a previous
    /// supervisor, then start `max_concurrency` workers.
    pub fn start(config: SupervisorConfig, store: Arc<dyn JobStore>) -> Result<Arc<Self>> {
        config.validate()?;
        std::fs::create_dir_all(config.jobs_dir())?;

        let launcher = SandboxLauncher::from_config(&config)?;
        let queue = JobQueue::new(config.queue_capacity);
        let next_sequence = store
            .list()?
            .iter()
            .map(|job| job.sequence)
            .max()
            .map_or(1, |max| max + 1);

        let report = recover(&config, store.as_ref(), Some(&queue))?;
        if !report.requeued.is_empty() || !report.failed.is_empty() {
            info!(
                "restart sweep: {} requeued, {} failed",
                report.requeued.len(),
                report.failed.len()
            );
        }

        let context = Arc::new(WorkerContext {
            store: Arc::clone(&store),
            launcher,
            jobs_dir: config.jobs_dir(),
            wall_timeout: config.wall_clock_timeout(),
            shutting_down: Default::default(),
        });

        let manager = Arc::new(Self {
            store,
            queue,
            context,
            workers: Mutex::new(WorkerRegistry::default()),
            submit_lock: Mutex::new(()),
            next_sequence: AtomicU64::new(next_sequence),
            next_worker_id: AtomicUsize::new(0),
            config,
        });
        manager.set_concurrency(manager.config.max_concurrency)?;
        info!(
            "job manager started: {} workers, queue capacity {}",
            manager.config.max_concurrency, manager.config.queue_capacity
        );
        Ok(manager)
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Non-blocking. A rejected submission leaves no record and no directory.
    pub fn submit(&self, request: SubmitRequest) -> Result<JobReceipt> {
        self.enqueue(request, None)
    }

    /// Retry a failed job under a new id
    pub fn resubmit(&self, job_id: &str) -> Result<JobReceipt> {
        let previous = self.job(job_id)?;
        if !matches!(previous.status, JobStatus::Error | JobStatus::TimedOut) {
            return Err(RuleboxError::NotReady(format!(
                "job {} is {}; only failed jobs can be resubmitted",
                job_id, previous.status
            )));
        }
        let dir = JobDirectory::open(&self.config.jobs_dir(), &previous.id);
        let request = SubmitRequest {
            document: dir.input_path(&previous.document_name),
            build: previous.build.clone(),
            network_access: Some(previous.network_access),
        };
        self.enqueue(request, Some(previous.id))
    }

    fn enqueue(&self, request: SubmitRequest, retry_of: Option<String>) -> Result<JobReceipt> {
        let _guard = self.submit_lock.lock().unwrap_or_else(|p| p.into_inner());
        if self.is_shutting_down() {
            return Err(RuleboxError::ShuttingDown);
        }
        if self.queue.is_full() {
            return Err(RuleboxError::QueueFull {
                capacity: self.queue.capacity(),
            });
        }
        if !request.document.is_file() {
            return Err(RuleboxError::Config(format!(
                "document {} does not exist",
                request.document.display()
            )));
        }
        let manifest = request.build.load_manifest()?;

        let id = Uuid::new_v4().to_string();
        let dir = JobDirectory::create(&self.config.jobs_dir(), &id)?;
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let created = dir.copy_input(&request.document).and_then(|(name, digest)| {
            let events = EventLog::open(&dir.events_path())?;
            let job = Job {
                id: id.clone(),
                status: JobStatus::Queued,
                sequence,
                document: request.document.clone(),
                document_name: name,
                input_sha256: digest,
                build: request.build.clone(),
                output_name: manifest.output_name.clone(),
                network_access: request
                    .network_access
                    .unwrap_or(self.config.default_network_access),
                submitted_at: Utc::now(),
                started_at: None,
                finished_at: None,
                error_summary: None,
                failure: None,
                retry_of,
            };
            self.store.insert(&job)?;
            Ok((job, events))
        });
        let (mut job, events) = match created {
            Ok(created) => created,
            Err(e) => {
                dir.discard();
                return Err(e);
            }
        };

        events.append_best_effort(&Event::new(&job.id, EventSource::Supervisor, EventKind::JobQueued));

        if let Err(e) = self.queue.try_push(QueueEntry {
            job_id: job.id.clone(),
            sequence,
        }) {
            // Only submitters push and they hold the lock, so this is a closed queue.
            job.finish(JobStatus::Error, Some(e.to_string()), Some(FailureKind::LaunchFailure))?;
            self.store.update(&job)?;
            return Err(e);
        }

        info!("job {} queued (sequence {})", job.id, sequence);
        Ok(JobReceipt {
            job_id: job.id,
            status: job.status,
        })
    }

    /// Resize the worker pool. Shrinking retires the newest workers; busy
    /// ones finish their current job first.
    pub fn set_concurrency(&self, n: usize) -> Result<()> {
        if n == 0 {
            return Err(RuleboxError::Config(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.is_shutting_down() {
            return Err(RuleboxError::ShuttingDown);
        }
        let mut registry = self.workers.lock().unwrap_or_else(|p| p.into_inner());

        let (done, still_retiring): (Vec<_>, Vec<_>) = registry
            .retiring
            .drain(..)
            .partition(|worker| worker.is_finished());
        registry.retiring = still_retiring;
        for worker in done {
            worker.join();
        }

        while registry.active.len() < n {
            let id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
            let worker = WorkerHandle::spawn(id, Arc::clone(&self.context), self.queue.receiver())?;
            registry.active.push(worker);
        }
        while registry.active.len() > n {
            if let Some(worker) = registry.active.pop() {
                worker.retire();
                registry.retiring.push(worker);
            }
        }
        info!("concurrency set to {}", n);
        Ok(())
    }

    pub fn concurrency(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .active
            .len()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn job(&self, job_id: &str) -> Result<Job> {
        self.store
            .get(job_id)?
            .ok_or_else(|| RuleboxError::UnknownJob(job_id.to_string()))
    }

    pub fn get_status(&self, job_id: &str) -> Result<StatusReport> {
        Ok(self.job(job_id)?.report())
    }

    /// Artifact bytes, once the job is terminal
    pub fn get_artifact(&self, job_id: &str) -> Result<Vec<u8>> {
        let job = self.job(job_id)?;
        let path = JobDirectory::open(&self.config.jobs_dir(), job_id).artifact_path();
        if !job.status.is_terminal() || !path.is_file() {
            return Err(RuleboxError::NotReady(format!(
                "artifact for job {} is not available ({})",
                job_id, job.status
            )));
        }
        Ok(std::fs::read(path)?)
    }

    /// Normalized output bytes; only successful jobs have one
    pub fn get_output(&self, job_id: &str) -> Result<Vec<u8>> {
        let job = self.job(job_id)?;
        if job.status != JobStatus::Success {
            return Err(RuleboxError::NotReady(format!(
                "job {} is {}; output exists only for successful jobs",
                job_id, job.status
            )));
        }
        let path = JobDirectory::open(&self.config.jobs_dir(), job_id).output_path(&job.output_name);
        Ok(std::fs::read(path)?)
    }

    /// Poll the record until it is terminal or `timeout` passes
    pub fn wait_for_terminal(&self, job_id: &str, timeout: Duration) -> Result<StatusReport> {
        let deadline = Instant::now() + timeout;
        loop {
            let report = self.get_status(job_id)?;
            if report.status.is_terminal() {
                return Ok(report);
            }
            if Instant::now() >= deadline {
                return Err(RuleboxError::NotReady(format!(
                    "job {} still {} after {:?}",
                    job_id, report.status, timeout
                )));
            }
            std::thread::sleep(STATUS_POLL);
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.context.shutting_down.load(Ordering::SeqCst)
    }

    /// Stop accepting work and join every worker after its current job.
    /// Pending entries stay `Queued` in the store. Idempotent.
    pub fn shutdown(&self) {
        {
            let _guard = self.submit_lock.lock().unwrap_or_else(|p| p.into_inner());
            if self.context.shutting_down.swap(true, Ordering::SeqCst) {
                return;
            }
        }
        let workers: Vec<WorkerHandle> = {
            let mut registry = self.workers.lock().unwrap_or_else(|p| p.into_inner());
            let mut all: Vec<WorkerHandle> = registry.active.drain(..).collect();
            all.append(&mut registry.retiring);
            all
        };
        for worker in &workers {
            worker.retire();
        }
        for worker in workers {
            worker.join();
        }
        info!("job manager stopped; {} jobs left queued", self.queue.len());
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Sweep records a previous supervisor left behind.
///
/// `Running` records become `Error` ("supervisor restarted"). `Queued` records
/// go back on `queue` in sequence order when requeueing is enabled; with no
/// queue they are left alone.
pub fn recover(
    config: &SupervisorConfig,
    store: &dyn JobStore,
    queue: Option<&JobQueue>,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let jobs_dir = config.jobs_dir();

    for mut job in store.list()? {
        match job.status {
            JobStatus::Running => {
                fail_orphan(store, &jobs_dir, &mut job, RESTART_SUMMARY, FailureKind::SupervisorRestarted)?;
                report.failed.push(job.id);
            }
            JobStatus::Queued if !config.requeue_on_restart => {
                fail_orphan(store, &jobs_dir, &mut job, RESTART_SUMMARY, FailureKind::SupervisorRestarted)?;
                report.failed.push(job.id);
            }
            JobStatus::Queued => {
                let Some(queue) = queue else { continue };
                let entry = QueueEntry {
                    job_id: job.id.clone(),
                    sequence: job.sequence,
                };
                match queue.try_push(entry) {
                    Ok(()) => report.requeued.push(job.id),
                    Err(_) => {
                        fail_orphan(store, &jobs_dir, &mut job, REQUEUE_FULL_SUMMARY, FailureKind::LaunchFailure)?;
                        report.failed.push(job.id);
                    }
                }
            }
            _ => {}
        }
    }
    Ok(report)
}

fn fail_orphan(
    store: &dyn JobStore,
    jobs_dir: &Path,
    job: &mut Job,
    summary: &str,
    failure: FailureKind,
) -> Result<()> {
    job.finish(JobStatus::Error, Some(summary.to_string()), Some(failure.clone()))?;
    store.update(job)?;

    let dir = JobDirectory::open(jobs_dir, &job.id);
    if dir.exists() {
        let vocabulary = job
            .build
            .load_manifest()
            .map(|m| m.vocabulary())
            .unwrap_or_default();
        let mut writer = ArtifactWriter::resume(&dir.artifact_path(), &job.id, vocabulary);
        writer.mark_failed(ArtifactError {
            failure,
            stage: None,
            code: None,
            exit: None,
        });
        if let Err(e) = writer.checkpoint() {
            warn!("job {}: partial artifact not written: {}", job.id, e);
        }
        match EventLog::open(&dir.events_path()) {
            Ok(events) => events.append_best_effort(
                &Event::new(&job.id, EventSource::Supervisor, EventKind::JobFailed).with_detail(summary),
            ),
            Err(e) => warn!("job {}: event log unavailable: {}", job.id, e),
        }
    }
    warn!("job {} swept to Error: {}", job.id, summary);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::FsJobStore;
    use crate::sandbox::build::BuildRef;
    use std::path::PathBuf;
    use crate::jobs::types::sample_job;
    use crate::observability::events::read_events;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    struct Fixture {
        data: tempfile::TempDir,
        config: SupervisorConfig,
        build: BuildRef,
        document: PathBuf,
    }

    /// Runner stand-in that blocks until `release` appears, so queued jobs
    /// stay queued for as long as a test needs.
    fn fixture(queue_capacity: usize) -> Fixture {
        let data = tempfile::tempdir().unwrap();
        let build_root = data.path().join("build");
        fs::create_dir_all(build_root.join("package")).unwrap();
        fs::write(
            build_root.join("manifest.json"),
            r#"{"entrypoint": ["p.sh"], "interpreter": "/bin/sh"}"#,
        )
        .unwrap();
        let runner = data.path().join("runner.sh");
        let release = data.path().join("release");
        fs::write(
            &runner,
            format!(
                "#!/bin/sh\nwhile [ ! -e {} ]; do sleep 0.05; done\nexit 10\n",
                release.display()
            ),
        )
        .unwrap();
        fs::set_permissions(&runner, fs::Permissions::from_mode(0o755)).unwrap();
        let document = data.path().join("members.csv");
        fs::write(&document, "name\n").unwrap();

        let config = SupervisorConfig {
            data_root: data.path().join("data"),
            max_concurrency: 1,
            queue_capacity,
            runner_binary: Some(runner),
            kill_grace_ms: 50,
            ..Default::default()
        };
        Fixture {
            data,
            config,
            build: BuildRef::new("b1", build_root),
            document,
        }
    }

    fn release(f: &Fixture) {
        fs::write(f.data.path().join("release"), b"").unwrap();
    }

    fn request(f: &Fixture) -> SubmitRequest {
        SubmitRequest {
            document: f.document.clone(),
            build: f.build.clone(),
            network_access: None,
        }
    }

    fn store(f: &Fixture) -> Arc<dyn JobStore> {
        Arc::new(FsJobStore::open(&f.config.registry_dir()).unwrap())
    }

    fn wait_running(manager: &JobManager, id: &str) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while manager.get_status(id).unwrap().status != JobStatus::Running {
            assert!(Instant::now() < deadline, "job {} never started", id);
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn full_queue_rejects_without_creating_anything() {
        let f = fixture(1);
        let manager = JobManager::start(f.config.clone(), store(&f)).unwrap();

        let first = manager.submit(request(&f)).unwrap();
        wait_running(&manager, &first.job_id);
        let second = manager.submit(request(&f)).unwrap();
        assert_eq!(second.status, JobStatus::Queued);

        let err = manager.submit(request(&f)).unwrap_err();
        assert!(matches!(err, RuleboxError::QueueFull { capacity: 1 }));
        assert_eq!(fs::read_dir(f.config.jobs_dir()).unwrap().count(), 2);
        assert_eq!(fs::read_dir(f.config.registry_dir()).unwrap().count(), 2);

        release(&f);
        let report = manager
            .wait_for_terminal(&second.job_id, Duration::from_secs(20))
            .unwrap();
        assert_eq!(report.status, JobStatus::Error);
        manager.shutdown();
    }

    #[test]
    fn bad_submissions_are_config_errors() {
        let f = fixture(2);
        let manager = JobManager::start(f.config.clone(), store(&f)).unwrap();
        let mut missing = request(&f);
        missing.document = f.data.path().join("nope.csv");
        assert!(matches!(
            manager.submit(missing),
            Err(RuleboxError::Config(_))
        ));
        let mut no_manifest = request(&f);
        no_manifest.build = BuildRef::new("b2", f.data.path().join("absent"));
        assert!(matches!(
            manager.submit(no_manifest),
            Err(RuleboxError::Config(_))
        ));
        assert_eq!(fs::read_dir(f.config.jobs_dir()).unwrap().count(), 0);
        manager.shutdown();
    }

    #[test]
    fn status_artifact_output_and_resubmit() {
        let f = fixture(2);
        release(&f);
        let manager = JobManager::start(f.config.clone(), store(&f)).unwrap();
        let receipt = manager.submit(request(&f)).unwrap();

        assert!(matches!(
            manager.get_status("missing"),
            Err(RuleboxError::UnknownJob(_))
        ));
        let report = manager
            .wait_for_terminal(&receipt.job_id, Duration::from_secs(20))
            .unwrap();
        assert_eq!(report.status, JobStatus::Error);
        assert_eq!(report.error_summary.as_deref(), Some("rule pipeline failed"));
        assert!(manager.get_artifact(&receipt.job_id).is_ok());
        assert!(matches!(
            manager.get_output(&receipt.job_id),
            Err(RuleboxError::NotReady(_))
        ));

        let retry = manager.resubmit(&receipt.job_id).unwrap();
        assert_ne!(retry.job_id, receipt.job_id);
        let store = FsJobStore::open(&f.config.registry_dir()).unwrap();
        let record = store.get(&retry.job_id).unwrap().unwrap();
        assert_eq!(record.retry_of.as_deref(), Some(receipt.job_id.as_str()));
        manager.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent_and_refuses_work() {
        let f = fixture(2);
        let manager = JobManager::start(f.config.clone(), store(&f)).unwrap();
        manager.shutdown();
        manager.shutdown();
        assert!(matches!(
            manager.submit(request(&f)),
            Err(RuleboxError::ShuttingDown)
        ));
    }

    #[test]
    fn concurrency_can_grow_and_shrink() {
        let f = fixture(2);
        let manager = JobManager::start(f.config.clone(), store(&f)).unwrap();
        manager.set_concurrency(3).unwrap();
        assert_eq!(manager.concurrency(), 3);
        manager.set_concurrency(1).unwrap();
        assert_eq!(manager.concurrency(), 1);
        assert!(manager.set_concurrency(0).is_err());
        manager.shutdown();
    }

    #[test]
    fn retired_busy_worker_finishes_its_job_and_takes_no_more() {
        let f = fixture(4);
        let manager = JobManager::start(f.config.clone(), store(&f)).unwrap();
        manager.set_concurrency(2).unwrap();
        let a = manager.submit(request(&f)).unwrap();
        let b = manager.submit(request(&f)).unwrap();
        wait_running(&manager, &a.job_id);
        wait_running(&manager, &b.job_id);

        manager.set_concurrency(1).unwrap();
        assert_eq!(manager.concurrency(), 1);
        let c = manager.submit(request(&f)).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(manager.get_status(&c.job_id).unwrap().status, JobStatus::Queued);

        release(&f);
        for id in [&a.job_id, &b.job_id, &c.job_id] {
            let report = manager.wait_for_terminal(id, Duration::from_secs(20)).unwrap();
            assert_eq!(report.status, JobStatus::Error);
            assert_eq!(report.error_summary.as_deref(), Some("rule pipeline failed"));
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let registry = manager.workers.lock().unwrap();
            assert_eq!(registry.retiring.len(), 1);
            if registry.retiring.iter().all(|w| w.is_finished()) {
                assert!(registry.active.iter().all(|w| !w.is_finished()));
                break;
            }
            drop(registry);
            assert!(Instant::now() < deadline, "retired worker never exited");
            std::thread::sleep(Duration::from_millis(20));
        }
        manager.shutdown();
    }

    /// Store that refuses a record whose event log is not open yet, or
    /// every record when `reject` is set.
    struct LogFirstStore {
        inner: FsJobStore,
        jobs_dir: PathBuf,
        reject: bool,
    }

    impl JobStore for LogFirstStore {
        fn insert(&self, job: &Job) -> Result<()> {
            let events = JobDirectory::open(&self.jobs_dir, &job.id).events_path();
            if self.reject || !events.is_file() {
                return Err(RuleboxError::Store(format!("refused {}", job.id)));
            }
            self.inner.insert(job)
        }
        fn update(&self, job: &Job) -> Result<()> {
            self.inner.update(job)
        }
        fn get(&self, job_id: &str) -> Result<Option<Job>> {
            self.inner.get(job_id)
        }
        fn list(&self) -> Result<Vec<Job>> {
            self.inner.list()
        }
    }

    #[test]
    fn event_log_is_open_before_the_record_exists() {
        let f = fixture(2);
        release(&f);
        let logged: Arc<dyn JobStore> = Arc::new(LogFirstStore {
            inner: FsJobStore::open(&f.config.registry_dir()).unwrap(),
            jobs_dir: f.config.jobs_dir(),
            reject: false,
        });
        let manager = JobManager::start(f.config.clone(), logged).unwrap();
        let receipt = manager.submit(request(&f)).unwrap();
        assert!(manager
            .wait_for_terminal(&receipt.job_id, Duration::from_secs(20))
            .is_ok());
        manager.shutdown();
    }

    #[test]
    fn failed_insert_leaves_no_directory() {
        let f = fixture(2);
        let refusing: Arc<dyn JobStore> = Arc::new(LogFirstStore {
            inner: FsJobStore::open(&f.config.registry_dir()).unwrap(),
            jobs_dir: f.config.jobs_dir(),
            reject: true,
        });
        let manager = JobManager::start(f.config.clone(), refusing).unwrap();
        assert!(matches!(
            manager.submit(request(&f)),
            Err(RuleboxError::Store(_))
        ));
        assert_eq!(fs::read_dir(f.config.jobs_dir()).unwrap().count(), 0);
        assert_eq!(fs::read_dir(f.config.registry_dir()).unwrap().count(), 0);
        manager.shutdown();
    }

    #[test]
    fn recovery_sweeps_running_and_requeues_queued() {
        let f = fixture(1);
        let store = FsJobStore::open(&f.config.registry_dir()).unwrap();
        let jobs_dir = f.config.jobs_dir();

        let mut running = sample_job("running", 1);
        running.mark_running().unwrap();
        store.insert(&running).unwrap();
        JobDirectory::create(&jobs_dir, "running").unwrap();
        store.insert(&sample_job("queued-a", 2)).unwrap();
        store.insert(&sample_job("queued-b", 3)).unwrap();

        let queue = JobQueue::new(1);
        let report = recover(&f.config, &store, Some(&queue)).unwrap();
        assert_eq!(report.requeued, vec!["queued-a"]);
        assert_eq!(report.failed, vec!["running", "queued-b"]);

        let swept = store.get("running").unwrap().unwrap();
        assert_eq!(swept.status, JobStatus::Error);
        assert_eq!(swept.error_summary.as_deref(), Some(RESTART_SUMMARY));
        assert_eq!(swept.failure, Some(FailureKind::SupervisorRestarted));
        let events = read_events(&jobs_dir.join("running/logs/events.ndjson")).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::JobFailed);

        let overflow = store.get("queued-b").unwrap().unwrap();
        assert_eq!(overflow.error_summary.as_deref(), Some(REQUEUE_FULL_SUMMARY));
    }

    #[test]
    fn sweep_without_queue_leaves_queued_jobs() {
        let f = fixture(1);
        let store = FsJobStore::open(&f.config.registry_dir()).unwrap();
        store.insert(&sample_job("queued", 1)).unwrap();
        let report = recover(&f.config, &store, None).unwrap();
        assert!(report.requeued.is_empty() && report.failed.is_empty());
        assert_eq!(
            store.get("queued").unwrap().unwrap().status,
            JobStatus::Queued
        );
    }
}
