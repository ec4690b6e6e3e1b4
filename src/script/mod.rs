pub mod environment;
pub mod error;
pub mod execution;
pub(crate) mod host;
pub mod runner;

pub use environment::{ScriptEnvironment, ScriptSettings, Started};
pub use error::ScriptError;
pub use execution::{Execution, ExecutionId, ExecutionState};
