/// Signal plumbing: supervisor shutdown flag, process-group termination,
/// and classification of how a sandboxed process died
use crate::config::types::ResourceKind;
use log::info;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Global shutdown flag (async-safe atomic)
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Global signal received (async-safe atomic)
static SIGNAL_RECEIVED: AtomicU32 = AtomicU32::new(0);

/// Signal handler state
pub struct SignalHandler;

impl SignalHandler {
    /// Install SIGINT/SIGTERM/SIGHUP handlers.
    /// Must be called early in main() before any threads are spawned
    pub fn init() -> Result<Self, String> {
        let sig_action = SigAction::new(
            SigHandler::Handler(Self::signal_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        unsafe {
            signal::sigaction(Signal::SIGINT, &sig_action)
                .map_err(|e| format!("Failed to install SIGINT handler: {}", e))?;
            signal::sigaction(Signal::SIGTERM, &sig_action)
                .map_err(|e| format!("Failed to install SIGTERM handler: {}", e))?;
            signal::sigaction(Signal::SIGHUP, &sig_action)
                .map_err(|e| format!("Failed to install SIGHUP handler: {}", e))?;
        }

        info!("Signal handlers installed (SIGINT, SIGTERM, SIGHUP)");
        Ok(Self)
    }

    /// Only atomic stores: no allocations, no locks, no I/O
    extern "C" fn signal_handler(signal: libc::c_int) {
        SIGNAL_RECEIVED.store(signal as u32, Ordering::SeqCst);
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
    }

    /// Signal that was received (0 if none)
    pub fn get_signal(&self) -> u32 {
        SIGNAL_RECEIVED.load(Ordering::SeqCst)
    }
}

/// What the supervisor did to stop a process group
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KillReport {
    pub term_sent: bool,
    pub kill_sent: bool,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}

/// SIGTERM the whole group, give it `grace`, then SIGKILL the group.
///
/// Falls back to signalling the leader alone when the group is already gone
/// or was never created.
pub fn terminate_process_group(leader: i32, grace: Duration) -> KillReport {
    let mut report = KillReport::default();
    let start = Instant::now();
    let group = Pid::from_raw(-leader);
    let pid = Pid::from_raw(leader);

    match signal::kill(group, Signal::SIGTERM) {
        Ok(()) => report.term_sent = true,
        Err(e) => {
            report.term_sent = signal::kill(pid, Signal::SIGTERM).is_ok();
            report
                .notes
                .push(format!("group SIGTERM fallback used: {}", e));
        }
    }

    if !grace.is_zero() {
        std::thread::sleep(grace);
    }

    match signal::kill(group, Signal::SIGKILL) {
        Ok(()) => report.kill_sent = true,
        Err(e) => {
            report.kill_sent = signal::kill(pid, Signal::SIGKILL).is_ok();
            report
                .notes
                .push(format!("group SIGKILL fallback used: {}", e));
        }
    }

    report.waited_ms = start.elapsed().as_millis() as u64;
    report
}

/// Cause attributed to a signal-terminated sandbox process
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationCause {
    Limit(ResourceKind),
    /// Any other fatal signal; treated as a failure of the code itself.
    Crashed(i32),
}

/// Attribute a fatal signal using kernel evidence.
///
/// SIGKILL is ambiguous: the CPU hard limit and the OOM killer both send it,
/// so consumed CPU time decides.
pub fn classify_termination(
    signal: i32,
    cpu_used: Duration,
    cpu_limit_secs: Option<u64>,
) -> TerminationCause {
    match signal {
        libc::SIGXCPU => TerminationCause::Limit(ResourceKind::Cpu),
        libc::SIGXFSZ => TerminationCause::Limit(ResourceKind::OutputSize),
        libc::SIGKILL => match cpu_limit_secs {
            Some(limit) if cpu_used >= Duration::from_secs(limit) => {
                TerminationCause::Limit(ResourceKind::Cpu)
            }
            _ => TerminationCause::Limit(ResourceKind::Memory),
        },
        other => TerminationCause::Crashed(other),
    }
}
