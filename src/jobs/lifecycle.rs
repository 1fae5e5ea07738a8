/// Job lifecycle state machine
///
/// ```text
/// Queued -> Running -> { Success | Error | TimedOut }
/// Queued -> Error            (launch/dependency failure, restart sweep)
/// ```
/// Terminal states have no outgoing edges.
use crate::config::types::{Result, RuleboxError};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    Error,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Error | JobStatus::TimedOut
        )
    }

    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Queued, Running)
                | (Queued, Error)
                | (Running, Success)
                | (Running, Error)
                | (Running, TimedOut)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Queued => "Queued",
            JobStatus::Running => "Running",
            JobStatus::Success => "Success",
            JobStatus::Error => "Error",
            JobStatus::TimedOut => "TimedOut",
        };
        write!(f, "{}", name)
    }
}

/// Check an edge, producing `IllegalTransition` for anything not in the table
pub fn check_transition(job_id: &str, from: JobStatus, to: JobStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(RuleboxError::IllegalTransition {
            job_id: job_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use JobStatus::*;

    const ALL: [JobStatus; 5] = [Queued, Running, Success, Error, TimedOut];

    #[test]
    fn terminal_states_are_final() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(check_transition("j", *from, to).is_err(), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn allowed_edges() {
        assert!(check_transition("j", Queued, Running).is_ok());
        assert!(check_transition("j", Queued, Error).is_ok());
        assert!(check_transition("j", Running, Success).is_ok());
        assert!(check_transition("j", Running, TimedOut).is_ok());
        assert!(check_transition("j", Queued, Success).is_err());
        assert!(check_transition("j", Queued, TimedOut).is_err());
        assert!(check_transition("j", Running, Queued).is_err());
        assert!(check_transition("j", Running, Running).is_err());
    }

    #[test]
    fn illegal_transition_names_both_states() {
        let err = check_transition("abc", Success, Running).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("abc"));
        assert!(text.contains("Success -> Running"));
    }

    #[test]
    fn status_serializes_by_name() {
        assert_eq!(serde_json::to_string(&TimedOut).unwrap(), "\"TimedOut\"");
    }
}
