/// Resource ceilings applied inside a freshly forked child, before it execs
///
/// Everything reachable from [`ResourceLimits::apply`] runs between fork and exec,
/// so it must stay async-signal-safe: raw `libc` calls only, no allocation, no logging.
/// Errors are reported as `io::Error::last_os_error()`, which does not allocate.
use serde::{Deserialize, Serialize};
use std::io;

/// Per-launch resource budget, sourced from the supervisor configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU seconds before SIGXCPU (SIGKILL one second later)
    pub cpu_seconds: u64,
    /// Address-space ceiling
    pub memory_bytes: u64,
    /// Largest file the child may write, including its own log
    pub output_bytes: u64,
    /// Open file descriptor ceiling
    pub open_files: u64,
}

/// One rlimit the limiter will set
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RlimitSetting {
    pub name: &'static str,
    pub resource: libc::__rlimit_resource_t,
    pub soft: u64,
    pub hard: u64,
}

impl ResourceLimits {
    /// Fixed ordering of the ceilings. Soft equals hard everywhere except CPU,
    /// so an unprivileged child can never raise a limit back up.
    pub fn plan(&self) -> [RlimitSetting; 5] {
        let cpu = self.cpu_seconds.max(1);
        [
            RlimitSetting {
                name: "RLIMIT_CORE",
                resource: libc::RLIMIT_CORE,
                soft: 0,
                hard: 0,
            },
            RlimitSetting {
                name: "RLIMIT_CPU",
                resource: libc::RLIMIT_CPU,
                soft: cpu,
                hard: cpu + 1,
            },
            RlimitSetting {
                name: "RLIMIT_AS",
                resource: libc::RLIMIT_AS,
                soft: self.memory_bytes,
                hard: self.memory_bytes,
            },
            RlimitSetting {
                name: "RLIMIT_FSIZE",
                resource: libc::RLIMIT_FSIZE,
                soft: self.output_bytes,
                hard: self.output_bytes,
            },
            RlimitSetting {
                name: "RLIMIT_NOFILE",
                resource: libc::RLIMIT_NOFILE,
                soft: self.open_files,
                hard: self.open_files,
            },
        ]
    }

    /// Lower the calling process's ceilings. Async-signal-safe.
    pub fn apply(&self) -> io::Result<()> {
        for setting in self.plan().iter() {
            apply_rlimit_value(setting.resource, setting.soft, setting.hard)?;
        }
        Ok(())
    }
}

fn apply_rlimit_value(resource: libc::__rlimit_resource_t, soft: u64, hard: u64) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };

    let rc = unsafe { libc::setrlimit(resource, &limit) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Session and lifecycle setup for a sandbox child. Async-signal-safe.
///
/// The child becomes leader of its own process group, so the supervisor can
/// signal every descendant at once, and receives SIGKILL if the thread that
/// spawned it goes away.
pub fn detach_and_bind_lifetime() -> io::Result<()> {
    if unsafe { libc::setsid() } < 0 {
        return Err(io::Error::last_os_error());
    }

    bind_lifetime_to_parent()?;

    unsafe {
        libc::umask(0o077);
    }
    Ok(())
}

/// Ask the kernel for SIGKILL when the spawning thread exits. Async-signal-safe.
pub fn bind_lifetime_to_parent() -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        let rc = unsafe {
            libc::prctl(
                libc::PR_SET_PDEATHSIG,
                libc::SIGKILL as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Read back the calling process's current soft CPU limit, if finite.
pub fn current_cpu_limit_secs() -> Option<u64> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_CPU, &mut limit) };
    if rc != 0 || limit.rlim_cur == libc::RLIM_INFINITY {
        None
    } else {
        Some(limit.rlim_cur as u64)
    }
}
