//! Error definitions for the scripting subsystem

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScriptError {
    /// The interpreter or its host bindings could not be set up
    #[error("Interpreter error: {0}")]
    Interpreter(String),

    /// The program text did not compile
    #[error("Failed to load program: {0}")]
    Load(String),

    /// The startup run of a program raised an error
    #[error("Program failed during startup: {0}")]
    Startup(String),

    /// A coroutine could not be created for a new execution
    #[error("Failed to start execution: {0}")]
    Start(String),
}
