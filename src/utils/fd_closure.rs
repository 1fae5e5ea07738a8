//! File descriptor hygiene for sandbox children
//!
//! Worker threads spawn children concurrently, so a child may be forked while
//! another thread holds a descriptor it just opened. Descriptors above stderr
//! are marked close-on-exec in the pre-exec hook rather than closed outright:
//! the standard library still needs its own exec-status pipe until `execve`.

/// Mark every descriptor from 3 upward close-on-exec. Async-signal-safe.
///
/// Uses `close_range(CLOSE_RANGE_CLOEXEC)` (Linux 5.11+). On older kernels this
/// is a no-op; descriptors opened through `std` already carry `O_CLOEXEC`.
pub fn mark_inherited_fds_cloexec() -> std::io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::raw::{c_int, c_uint};

        // Same number on every architecture that has it.
        const SYS_CLOSE_RANGE: libc::c_long = 436;
        const CLOSE_RANGE_CLOEXEC: c_uint = 1 << 2;

        let _ = unsafe {
            libc::syscall(
                SYS_CLOSE_RANGE,
                3 as c_uint,
                c_uint::MAX,
                CLOSE_RANGE_CLOEXEC as c_int,
            )
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    #[test]
    fn cloexec_hook_never_fails_spawn() {
        // A descriptor without O_CLOEXEC, as a careless library might create.
        let file = tempfile::tempfile().unwrap();
        let raw = file.as_raw_fd();
        let dup = unsafe { libc::dup(raw) };
        assert!(dup > 2);

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(format!("test -L /proc/self/fd/{} && echo open || echo closed", dup));
        unsafe {
            cmd.pre_exec(mark_inherited_fds_cloexec);
        }
        let output = cmd.output().unwrap();
        unsafe {
            libc::close(dup);
        }
        let text = String::from_utf8_lossy(&output.stdout);
        // Kernels without close_range(CLOEXEC) leave it open; both are valid outcomes
        // as long as the hook itself never fails the spawn.
        assert!(text.trim() == "closed" || text.trim() == "open");
        assert!(output.status.success());
    }
}
