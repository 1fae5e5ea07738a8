/// Child orchestrator: the process that runs inside the sandbox
///
/// It starts the rule pipeline, turns its protocol lines into artifact records
/// and runner events, and reports the outcome through its exit code. Its
/// working directory is the job directory and its stdout/stderr are the run log.
use crate::config::types::{FailureKind, Result, RuleboxError};
use crate::jobs::layout::JobDirectory;
use crate::kernel::rlimits::{bind_lifetime_to_parent, current_cpu_limit_secs};
use crate::kernel::signal::{classify_termination, TerminationCause};
use crate::observability::artifact::{ArtifactError, ArtifactWriter, TableDecision};
use crate::observability::events::{Event, EventKind, EventLog, EventSource};
use crate::runner::protocol::{parse_line, ChildExitCode, ParsedLine, PipelineMessage, StageOutcome};
use crate::sandbox::build::RulePackageManifest;
use crate::sandbox::deps::InstalledDependency;
use crate::utils::output::{BoundedLineReader, LineIntegrity, DEFAULT_MAX_LINE_BYTES};
use log::{error, info, warn};
use nix::sys::resource::{getrusage, UsageWho};
use std::io::Write;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::time::Duration;

/// Arguments of the hidden `child` subcommand
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildArgs {
    pub job_id: String,
    pub interpreter: PathBuf,
    pub input: PathBuf,
    pub output: PathBuf,
    pub entrypoint: Vec<String>,
}

/// Run the pipeline for one job and return the code to exit with
pub fn run_child(args: &ChildArgs) -> ChildExitCode {
    let mut session = match RunnerSession::open(args) {
        Ok(session) => session,
        Err(e) => {
            error!("runner setup failed for job {}: {}", args.job_id, e);
            return ChildExitCode::SetupFailed;
        }
    };
    session.run()
}

struct RunnerSession<'a> {
    args: &'a ChildArgs,
    events: EventLog,
    artifact: ArtifactWriter,
    failed_stage: Option<(String, String)>,
}

fn pipeline_cpu_time() -> Duration {
    match getrusage(UsageWho::RUSAGE_CHILDREN) {
        Ok(usage) => {
            let user = usage.user_time();
            let system = usage.system_time();
            let micros = (user.tv_sec() + system.tv_sec()) as i64 * 1_000_000
                + (user.tv_usec() + system.tv_usec()) as i64;
            Duration::from_micros(micros.max(0) as u64)
        }
        Err(_) => Duration::ZERO,
    }
}

impl<'a> RunnerSession<'a> {
    fn open(args: &'a ChildArgs) -> Result<Self> {
        let layout = JobDirectory::at(std::env::current_dir()?);
        let events = EventLog::open(&layout.events_path())?;
        let manifest = RulePackageManifest::load(&layout.manifest_path())?;

        let dependencies: Vec<InstalledDependency> = if layout.dependencies_path().exists() {
            serde_json::from_slice(&std::fs::read(layout.dependencies_path())?)?
        } else {
            Vec::new()
        };

        if !args.input.is_file() {
            return Err(RuleboxError::LaunchFailure(format!(
                "input {} is missing",
                args.input.display()
            )));
        }

        let mut artifact =
            ArtifactWriter::new(&layout.artifact_path(), &args.job_id, manifest.vocabulary());
        artifact.set_dependencies(dependencies);
        artifact.checkpoint()?;

        Ok(Self {
            args,
            events,
            artifact,
            failed_stage: None,
        })
    }

    fn event(&self, kind: EventKind) -> Event {
        Event::new(&self.args.job_id, EventSource::Runner, kind)
    }

    fn checkpoint(&mut self) {
        if let Err(e) = self.artifact.checkpoint() {
            warn!("artifact checkpoint failed: {}", e);
        }
    }

    fn run(&mut self) -> ChildExitCode {
        let mut cmd = Command::new(&self.args.interpreter);
        cmd.args(&self.args.entrypoint)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        unsafe {
            cmd.pre_exec(bind_lifetime_to_parent);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(
                    "cannot start pipeline {}: {}",
                    self.args.interpreter.display(),
                    e
                );
                return self.fail(ChildExitCode::SetupFailed, FailureKind::LaunchFailure, None);
            }
        };
        info!("pipeline started for job {}", self.args.job_id);

        if let Some(stdout) = child.stdout.take() {
            let mut reader = BoundedLineReader::new(stdout, DEFAULT_MAX_LINE_BYTES);
            loop {
                match reader.next_line() {
                    Ok(Some(line)) => {
                        if line.integrity == LineIntegrity::Truncated {
                            warn!("dropping overlong pipeline line");
                            self.artifact.drop_record();
                            continue;
                        }
                        match parse_line(&line.bytes) {
                            ParsedLine::Message(message) => self.apply(message),
                            ParsedLine::Unrecognized => self.artifact.drop_record(),
                            ParsedLine::Text => passthrough(&line.bytes),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("pipeline stdout read failed: {}", e);
                        break;
                    }
                }
            }
        }

        let status = match child.wait() {
            Ok(status) => status,
            Err(e) => {
                error!("cannot reap pipeline: {}", e);
                return self.fail(ChildExitCode::SetupFailed, FailureKind::LaunchFailure, None);
            }
        };
        self.finish(status, pipeline_cpu_time())
    }

    fn apply(&mut self, message: PipelineMessage) {
        match message {
            PipelineMessage::StageStarted { stage } => {
                if self.artifact.stage_started(&stage) {
                    self.events
                        .append_best_effort(&self.event(EventKind::StageStarted).with_stage(&stage));
                    self.checkpoint();
                }
            }
            PipelineMessage::StageFinished { stage, outcome } => {
                let code = match &outcome {
                    StageOutcome::Ok => None,
                    StageOutcome::Failed { code } => Some(code.as_str()),
                };
                if !self.artifact.stage_finished(&stage, code) {
                    return;
                }
                let event = match code {
                    None => self.event(EventKind::StageFinished).with_stage(&stage),
                    Some(code) => {
                        if self.failed_stage.is_none() {
                            self.failed_stage = Some((stage.clone(), code.to_string()));
                        }
                        self.event(EventKind::StageFailed)
                            .with_stage(&stage)
                            .with_detail(code)
                    }
                };
                self.events.append_best_effort(&event);
                self.checkpoint();
            }
            PipelineMessage::Table {
                sheet_index,
                header_row,
                first_data_row,
                last_data_row,
                column_count,
            } => {
                self.artifact.add_table(TableDecision {
                    sheet_index,
                    header_row,
                    first_data_row,
                    last_data_row,
                    column_count,
                });
            }
            PipelineMessage::Mapping {
                table_index,
                column_index,
                field,
                score,
            } => {
                self.artifact
                    .add_mapping(table_index, column_index, field.as_deref(), score.as_ref());
            }
            PipelineMessage::Issue {
                row,
                column,
                code,
                severity,
            } => {
                self.artifact.add_issue(row, column, &code, severity);
            }
        }
    }

    fn finish(&mut self, status: ExitStatus, cpu: Duration) -> ChildExitCode {
        let exit = match (status.code(), status.signal()) {
            (Some(code), _) => format!("exit {}", code),
            (None, Some(sig)) => format!("signal {}", sig),
            (None, None) => "unknown".to_string(),
        };
        self.events
            .append_best_effort(&self.event(EventKind::PipelineExited).with_detail(exit.clone()));

        if let Some(sig) = status.signal() {
            return match classify_termination(sig, cpu, current_cpu_limit_secs()) {
                TerminationCause::Limit(kind) => {
                    warn!("pipeline stopped by {} limit", kind);
                    self.fail(
                        ChildExitCode::for_resource(kind),
                        FailureKind::ResourceLimitExceeded { resource: kind },
                        Some(exit),
                    )
                }
                TerminationCause::Crashed(_) => self.fail(
                    ChildExitCode::PipelineFailed,
                    FailureKind::UserCodeException,
                    Some(exit),
                ),
            };
        }

        if status.code() != Some(0) {
            return self.fail(
                ChildExitCode::PipelineFailed,
                FailureKind::UserCodeException,
                Some(exit),
            );
        }

        if self.failed_stage.is_some() {
            return self.fail(
                ChildExitCode::PipelineFailed,
                FailureKind::UserCodeException,
                None,
            );
        }

        if !self.args.output.is_file() {
            warn!("pipeline exited cleanly without writing {}", self.args.output.display());
        }
        self.artifact.mark_succeeded();
        self.checkpoint();
        info!("pipeline finished for job {}", self.args.job_id);
        ChildExitCode::Success
    }

    fn fail(&mut self, code: ChildExitCode, failure: FailureKind, exit: Option<String>) -> ChildExitCode {
        let (stage, stage_code) = match &self.failed_stage {
            Some((stage, stage_code)) => (Some(stage.clone()), Some(stage_code.clone())),
            None => (None, None),
        };
        self.artifact.mark_failed(ArtifactError {
            failure,
            stage,
            code: stage_code,
            exit,
        });
        self.checkpoint();
        code
    }
}

/// Copy a non-protocol line to the run log
fn passthrough(bytes: &[u8]) {
    let mut stderr = std::io::stderr().lock();
    let _ = stderr.write_all(bytes);
    let _ = stderr.write_all(b"\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::artifact::{Artifact, ArtifactStatus};
    use crate::observability::events::read_events;
    use std::fs;

    // The runner reads everything relative to its working directory, so these
    // tests drive the session through a job root rather than the process cwd.
    fn session_in(root: &std::path::Path, args: &ChildArgs) -> RunnerSession<'static> {
        let layout = JobDirectory::at(root.to_path_buf());
        fs::create_dir_all(root.join("rules")).unwrap();
        fs::create_dir_all(root.join("logs")).unwrap();
        fs::write(
            layout.manifest_path(),
            r#"{"entrypoint": ["x"], "fields": ["first_name", "email"]}"#,
        )
        .unwrap();
        let args: &'static ChildArgs = Box::leak(Box::new(args.clone()));
        let mut artifact = ArtifactWriter::new(
            &layout.artifact_path(),
            &args.job_id,
            RulePackageManifest::load(&layout.manifest_path())
                .unwrap()
                .vocabulary(),
        );
        artifact.checkpoint().unwrap();
        RunnerSession {
            args,
            events: EventLog::open(&layout.events_path()).unwrap(),
            artifact,
            failed_stage: None,
        }
    }

    fn args(root: &std::path::Path) -> ChildArgs {
        ChildArgs {
            job_id: "job-1".to_string(),
            interpreter: PathBuf::from("/bin/sh"),
            input: root.join("input.csv"),
            output: root.join("out.csv"),
            entrypoint: vec![],
        }
    }

    #[test]
    fn failed_stage_fails_the_run_even_with_clean_exit() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_in(dir.path(), &args(dir.path()));
        session.apply(PipelineMessage::StageStarted {
            stage: "map_columns".to_string(),
        });
        session.apply(PipelineMessage::StageFinished {
            stage: "map_columns".to_string(),
            outcome: StageOutcome::Failed {
                code: "no_header_row".to_string(),
            },
        });
        let code = session.finish(ExitStatus::from_raw(0), Duration::ZERO);
        assert_eq!(code, ChildExitCode::PipelineFailed);

        let artifact = Artifact::load(&dir.path().join("logs/artifact.json")).unwrap();
        assert_eq!(artifact.status, ArtifactStatus::Failed);
        let error = artifact.error.unwrap();
        assert_eq!(error.stage.as_deref(), Some("map_columns"));
        assert_eq!(error.code.as_deref(), Some("no_header_row"));

        let kinds: Vec<_> = read_events(&dir.path().join("logs/events.ndjson"))
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::StageStarted,
                EventKind::StageFailed,
                EventKind::PipelineExited
            ]
        );
    }

    #[test]
    fn xcpu_signal_maps_to_cpu_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_in(dir.path(), &args(dir.path()));
        let code = session.finish(ExitStatus::from_raw(libc::SIGXCPU), Duration::from_secs(2));
        assert_eq!(code, ChildExitCode::CpuLimit);
    }

    #[test]
    fn nonzero_exit_is_pipeline_failure_with_exit_detail() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_in(dir.path(), &args(dir.path()));
        let code = session.finish(ExitStatus::from_raw(3 << 8), Duration::ZERO);
        assert_eq!(code, ChildExitCode::PipelineFailed);
        let artifact = Artifact::load(&dir.path().join("logs/artifact.json")).unwrap();
        assert_eq!(artifact.error.unwrap().exit.as_deref(), Some("exit 3"));
    }

    #[test]
    fn clean_run_marks_artifact_succeeded() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_in(dir.path(), &args(dir.path()));
        session.apply(PipelineMessage::Table {
            sheet_index: 0,
            header_row: 0,
            first_data_row: 1,
            last_data_row: 3,
            column_count: 2,
        });
        session.apply(PipelineMessage::Mapping {
            table_index: 0,
            column_index: 0,
            field: Some("email".to_string()),
            score: None,
        });
        let code = session.finish(ExitStatus::from_raw(0), Duration::ZERO);
        assert_eq!(code, ChildExitCode::Success);
        let artifact = Artifact::load(&dir.path().join("logs/artifact.json")).unwrap();
        assert_eq!(artifact.status, ArtifactStatus::Succeeded);
        assert_eq!(artifact.summary.mapped_columns, 1);
    }
}
