//! Output sinks for synthesized input events
//!
//! Scripts never talk to the operating system directly; every press,
//! release and relative move goes through an [`OutputSink`]. A single sink is
//! shared by all devices, so implementations serialize emission themselves.

pub mod uinput;

use std::sync::Mutex;

use tracing::info;

pub use uinput::UinputSink;

/// Errors raised while emitting synthetic events
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("Failed to create output device: {0}")]
    CreateDevice(String),

    #[error("Failed to emit event: {0}")]
    Emit(String),

    #[error("Output device lock poisoned")]
    Poisoned,
}

/// An action requested by a script
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputAction {
    Press(u16),
    Release(u16),
    MoveRelative { code: u16, delta: i32 },
}

pub trait OutputSink: Send + Sync {
    fn press_key(&self, code: u16) -> Result<(), OutputError>;

    fn release_key(&self, code: u16) -> Result<(), OutputError>;

    fn move_relative(&self, code: u16, delta: i32) -> Result<(), OutputError>;
}

/// Writes every action to the log instead of the system (`--dry-run`)
#[derive(Debug, Default)]
pub struct LoggingSink;

impl OutputSink for LoggingSink {
    fn press_key(&self, code: u16) -> Result<(), OutputError> {
        info!("press key {}", code);
        Ok(())
    }

    fn release_key(&self, code: u16) -> Result<(), OutputError> {
        info!("release key {}", code);
        Ok(())
    }

    fn move_relative(&self, code: u16, delta: i32) -> Result<(), OutputError> {
        info!("move relative {} by {}", code, delta);
        Ok(())
    }
}

/// Keeps every action in memory, in emission order
#[derive(Debug, Default)]
pub struct RecordingSink {
    actions: Mutex<Vec<OutputAction>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actions(&self) -> Vec<OutputAction> {
        self.actions
            .lock()
            .map(|actions| actions.clone())
            .unwrap_or_default()
    }

    fn record(&self, action: OutputAction) -> Result<(), OutputError> {
        self.actions
            .lock()
            .map_err(|_| OutputError::Poisoned)?
            .push(action);
        Ok(())
    }
}

impl OutputSink for RecordingSink {
    fn press_key(&self, code: u16) -> Result<(), OutputError> {
        self.record(OutputAction::Press(code))
    }

    fn release_key(&self, code: u16) -> Result<(), OutputError> {
        self.record(OutputAction::Release(code))
    }

    fn move_relative(&self, code: u16, delta: i32) -> Result<(), OutputError> {
        self.record(OutputAction::MoveRelative { code, delta })
    }
}
