/// Network gate for jobs that run without network access
///
/// The gate is an interpreter start-up hook placed first on the import path.
/// It swaps socket creation and name resolution for stubs that fail fast. This
/// is a software boundary inside the interpreter, not a kernel one: native code
/// that issues raw syscalls is not stopped by it.
use crate::config::types::{Result, RuleboxError};
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};

pub const GATE_MODULE: &str = "sitecustomize.py";

/// Message raised by every stubbed primitive
pub const DISABLED_MESSAGE: &str = "network access is disabled for this job";

const GATE_SOURCE: &str = r#"import socket as _socket

_MESSAGE = "network access is disabled for this job"


def _blocked(*_args, **_kwargs):
    raise PermissionError(_MESSAGE)


class _BlockedSocket(_socket.socket):
    def __init__(self, *_args, **_kwargs):
        raise PermissionError(_MESSAGE)


_socket.socket = _BlockedSocket
for _name in (
    "create_connection",
    "create_server",
    "getaddrinfo",
    "gethostbyname",
    "gethostbyname_ex",
    "gethostbyaddr",
    "socketpair",
    "fromfd",
):
    if hasattr(_socket, _name):
        setattr(_socket, _name, _blocked)
"#;

/// Value exported as `RULEBOX_NETWORK_ACCESS`
pub fn network_flag_value(network_access: bool) -> &'static str {
    if network_access {
        "1"
    } else {
        "0"
    }
}

/// Write the gate into `sandbox_dir` and return that directory for the import path.
pub fn install_gate(sandbox_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(sandbox_dir).map_err(|e| {
        RuleboxError::LaunchFailure(format!(
            "cannot create network gate directory {}: {}",
            sandbox_dir.display(),
            e
        ))
    })?;
    let module = sandbox_dir.join(GATE_MODULE);
    fs::write(&module, GATE_SOURCE).map_err(|e| {
        RuleboxError::LaunchFailure(format!("cannot write network gate: {}", e))
    })?;
    debug!("network gate installed at {}", module.display());
    Ok(sandbox_dir.to_path_buf())
}
