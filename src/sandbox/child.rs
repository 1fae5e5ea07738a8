/// Handle over one spawned sandbox child and its process group
use crate::config::types::{Result, RuleboxError};
use crate::kernel::signal::{terminate_process_group, KillReport};
use log::{debug, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::process::Child;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How the child ended, from its wait status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitState {
    Exited(i32),
    Signaled(i32),
}

impl fmt::Display for ExitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitState::Exited(code) => write!(f, "exit {}", code),
            ExitState::Signaled(sig) => write!(f, "signal {}", sig),
        }
    }
}

/// Evidence gathered when the child was reaped
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildExit {
    pub state: ExitState,
    pub timed_out: bool,
    pub wall: Duration,
    /// User plus system CPU of the reaped child
    pub cpu: Duration,
    pub kill_report: Option<KillReport>,
}

/// One running child. The pid is also its process-group id.
pub struct ChildHandle {
    /// Owns the stdio handles; reaping goes through `wait4` on `pid`.
    _child: Child,
    pid: i32,
    started: Instant,
    kill_grace: Duration,
    reaped: bool,
}

impl ChildHandle {
    pub fn new(child: Child, kill_grace: Duration) -> Self {
        let pid = child.id() as i32;
        Self {
            _child: child,
            pid,
            started: Instant::now(),
            kill_grace,
            reaped: false,
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Block until the child exits or `timeout` passes. On timeout the whole
    /// group gets SIGTERM, then SIGKILL after the grace period, and is reaped.
    pub fn wait(&mut self, timeout: Duration) -> Result<ChildExit> {
        if self.reaped {
            return Err(RuleboxError::Process(format!(
                "child {} was already reaped",
                self.pid
            )));
        }

        loop {
            if let Some((state, cpu)) = self.reap(false)? {
                return Ok(self.finish(state, cpu, false, None));
            }
            if self.started.elapsed() >= timeout {
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        debug!(
            "child {} exceeded wall-clock timeout of {:?}",
            self.pid, timeout
        );
        let report = terminate_process_group(self.pid, self.kill_grace);
        let (state, cpu) = self.reap_blocking()?;
        Ok(self.finish(state, cpu, true, Some(report)))
    }

    /// Forcibly stop the group and reap the leader
    pub fn kill(&mut self) -> Result<KillReport> {
        if self.reaped {
            return Ok(KillReport::default());
        }
        let report = terminate_process_group(self.pid, self.kill_grace);
        self.reap_blocking()?;
        Ok(report)
    }

    fn finish(
        &mut self,
        state: ExitState,
        cpu: Duration,
        timed_out: bool,
        kill_report: Option<KillReport>,
    ) -> ChildExit {
        // Background processes the child left in its group die with it.
        let _ = signal::kill(Pid::from_raw(-self.pid), Signal::SIGKILL);
        ChildExit {
            state,
            timed_out,
            wall: self.started.elapsed(),
            cpu,
            kill_report,
        }
    }

    fn reap_blocking(&mut self) -> Result<(ExitState, Duration)> {
        loop {
            if let Some(result) = self.reap(true)? {
                return Ok(result);
            }
        }
    }

    /// `wait4` on the leader; also yields its resource usage.
    fn reap(&mut self, block: bool) -> Result<Option<(ExitState, Duration)>> {
        let mut status: libc::c_int = 0;
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        let flags = if block { 0 } else { libc::WNOHANG };

        let rc = unsafe { libc::wait4(self.pid, &mut status, flags, &mut usage) };
        if rc == 0 {
            return Ok(None);
        }
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(RuleboxError::Process(format!("wait4({}): {}", self.pid, err)));
        }

        let state = if libc::WIFEXITED(status) {
            ExitState::Exited(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            ExitState::Signaled(libc::WTERMSIG(status))
        } else {
            // Stopped/continued notifications are not requested; keep waiting.
            return Ok(None);
        };

        self.reaped = true;
        Ok(Some((state, rusage_cpu(&usage))))
    }
}

fn timeval_duration(tv: &libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

fn rusage_cpu(usage: &libc::rusage) -> Duration {
    timeval_duration(&usage.ru_utime) + timeval_duration(&usage.ru_stime)
}

impl Drop for ChildHandle {
    fn drop(&mut self) {
        if !self.reaped {
            warn!("dropping unreaped child {}; killing its group", self.pid);
            let _ = self.kill();
        }
    }
}
