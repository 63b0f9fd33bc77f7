/// Argument list construction for the benchmarking tool.
pub mod command;
/// Process launch, monitoring and termination.
pub mod supervisor;

pub use command::ToolCommand;
pub use supervisor::{ProcessSupervisor, RunCompletion, RunOutcome};
