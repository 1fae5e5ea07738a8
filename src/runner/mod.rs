//! The sandboxed side of a job: the `child` subcommand and the line protocol
//! it reads from the rule pipeline

pub mod orchestrator;
pub mod protocol;

pub use orchestrator::{run_child, ChildArgs};
pub use protocol::{parse_line, ChildExitCode, ParsedLine, PipelineMessage, StageOutcome};
