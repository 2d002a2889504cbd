pub mod branching;
pub mod executor;
pub mod run_log;

pub use executor::{FlowExecutor, FlowRunResult, RunFailure, RunStatus};
pub use run_log::{ExecutionLog, RunLogWriter};
